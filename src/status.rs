//! Task status surface.
//!
//! Every instance update reports progress as structured [`StatusEvent`]s.
//! [`TaskLog`] keeps them in emission order and renders the progress lines an
//! operator watches while the task runs.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::info;

/// A progress event emitted by an instance update.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A replacement VM is being created.
    CreatingMissingVm {
        /// `<group>/<id>`.
        instance: String,
    },
    /// Packages are being fetched onto the replacement VM.
    DownloadingPackages {
        /// `<group>/<id>`.
        instance: String,
    },
    /// The job configuration is being applied and started.
    UpdatingInstance {
        /// Instance group.
        group: String,
        /// `<group>/<id>`.
        instance: String,
        /// One-based position in the change-set.
        position: usize,
        /// Size of the change-set.
        total: usize,
        /// Whether the instance is a canary.
        canary: bool,
    },
    /// The swap finished.
    Finished {
        /// `<group>/<id>`.
        instance: String,
    },
    /// The swap failed.
    Failed {
        /// `<group>/<id>`.
        instance: String,
        /// Failure description.
        message: String,
    },
}

impl StatusEvent {
    /// Instance the event belongs to.
    #[must_use]
    pub fn instance(&self) -> &str {
        match self {
            Self::CreatingMissingVm { instance }
            | Self::DownloadingPackages { instance }
            | Self::UpdatingInstance { instance, .. }
            | Self::Finished { instance }
            | Self::Failed { instance, .. } => instance,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreatingMissingVm { instance } => write!(formatter, "Creating missing vms: {instance}"),
            Self::DownloadingPackages { instance } => {
                write!(formatter, "Downloading packages: {instance}")
            }
            Self::UpdatingInstance {
                group,
                instance,
                position,
                total,
                canary,
            } => {
                write!(formatter, "Updating instance {group}: {position}/{total} ({instance})")?;
                if *canary {
                    formatter.write_str(" (canary)")?;
                }
                Ok(())
            }
            Self::Finished { instance } => write!(formatter, "Finished updating instance {instance}"),
            Self::Failed { instance, message } => {
                write!(formatter, "Failed updating instance {instance}: {message}")
            }
        }
    }
}

/// Ordered record of the status events of one task. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct TaskLog {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl TaskLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StatusEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event.
    pub fn record(&self, event: StatusEvent) {
        info!(instance = event.instance(), "{event}");
        self.lock().push(event);
    }

    /// Snapshot of every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<StatusEvent> {
        self.lock().clone()
    }

    /// Rendered progress lines in emission order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(ToString::to_string).collect()
    }

    /// Rendered progress lines for one instance.
    #[must_use]
    pub fn lines_for(&self, instance: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|event| event.instance() == instance)
            .map(ToString::to_string)
            .collect()
    }

    /// All lines joined with newlines.
    #[must_use]
    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}
