//! Task-level outcome aggregation.

use std::fmt;

use serde::Serialize;

use crate::disk::UnreconciledDisk;
use crate::model::InstanceKey;
use crate::types::VmCid;
use crate::update::{ErrorKind, UpdateRun, UpdateState};

/// How one instance ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstanceOutcome {
    /// The hot-swap completed.
    Done,
    /// The hot-swap failed.
    Failed {
        /// Terminal error kind.
        kind: ErrorKind,
        /// Failure description.
        message: String,
    },
    /// The instance was not updated.
    Skipped {
        /// Why it was left alone.
        reason: String,
    },
}

impl InstanceOutcome {
    /// Whether the instance reached `Done`.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Outcome of one instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceReport {
    /// `<group>/<id>`.
    pub instance: String,
    /// How it ended.
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
    /// States entered, in order; empty for skipped instances.
    pub states: Vec<UpdateState>,
}

impl InstanceReport {
    pub(super) fn skipped(key: &InstanceKey, reason: &str) -> Self {
        Self {
            instance: key.to_string(),
            outcome: InstanceOutcome::Skipped {
                reason: reason.to_owned(),
            },
            states: Vec::new(),
        }
    }

    pub(super) fn crashed(key: &InstanceKey) -> Self {
        Self {
            instance: key.to_string(),
            outcome: InstanceOutcome::Failed {
                kind: ErrorKind::Internal,
                message: String::from("update task panicked"),
            },
            states: Vec::new(),
        }
    }

    fn from_run(run: &UpdateRun) -> Self {
        let outcome = match (&run.error, run.failure_message()) {
            (Some(err), Some(message)) => InstanceOutcome::Failed {
                kind: err.kind(),
                message,
            },
            _ => InstanceOutcome::Done,
        };
        Self {
            instance: run.key.to_string(),
            outcome,
            states: run.history.clone(),
        }
    }
}

/// Result of an update task.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TaskReport {
    /// Per-instance outcomes in change-set order.
    pub instances: Vec<InstanceReport>,
    /// VMs that could not be deleted and need manual cleanup.
    pub orphaned_vms: Vec<VmCid>,
    /// Disks left away from their previous VM.
    pub unreconciled_disks: Vec<UnreconciledDisk>,
    /// Largest number of simultaneously active instance updates.
    pub peak_in_flight: usize,
}

impl TaskReport {
    pub(super) fn push_run(&mut self, run: UpdateRun) {
        self.instances.push(InstanceReport::from_run(&run));
        self.orphaned_vms.extend(run.orphaned_vms);
        self.unreconciled_disks.extend(run.unreconciled_disks);
    }

    /// Whether every instance reached `Done` and nothing was left behind.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.instances.iter().all(|report| report.outcome.is_done())
            && self.orphaned_vms.is_empty()
            && self.unreconciled_disks.is_empty()
    }

    /// Instances that did not reach `Done`.
    pub fn unsuccessful(&self) -> impl Iterator<Item = &InstanceReport> {
        self.instances
            .iter()
            .filter(|report| !report.outcome.is_done())
    }

    /// Outcome for `instance` (`<group>/<id>`).
    #[must_use]
    pub fn outcome_of(&self, instance: &str) -> Option<&InstanceOutcome> {
        self.instances
            .iter()
            .find(|report| report.instance == instance)
            .map(|report| &report.outcome)
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self
            .instances
            .iter()
            .filter(|report| report.outcome.is_done())
            .count();
        write!(
            formatter,
            "{done}/{} instance(s) updated",
            self.instances.len()
        )?;
        for report in self.unsuccessful() {
            match &report.outcome {
                InstanceOutcome::Failed { kind, message } => {
                    write!(formatter, "\n  {}: {kind}: {message}", report.instance)?;
                }
                InstanceOutcome::Skipped { reason } => {
                    write!(formatter, "\n  {}: skipped: {reason}", report.instance)?;
                }
                InstanceOutcome::Done => {}
            }
        }
        for cid in &self.orphaned_vms {
            write!(formatter, "\n  orphaned vm {cid} needs manual cleanup")?;
        }
        for disk in &self.unreconciled_disks {
            write!(formatter, "\n  disk {} needs reconciliation: {}", disk.disk, disk.reason)?;
        }
        Ok(())
    }
}
