//! Errors that end an instance update, and their classification.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentError;
use crate::backend::ProviderError;
use crate::disk::MigrationFailure;
use crate::model::ProcessState;
use crate::types::{DiskCid, VmCid};
use crate::vm::VmError;

use super::state::{IllegalTransition, UpdateState};

/// Terminal error kinds reported per failed instance.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A VM or disk provider operation failed.
    ProviderError,
    /// An agent did not answer within the step's budget.
    AgentTimeout,
    /// An agent answered with a failure.
    AgentRejected,
    /// The replacement never reported `running` within the watch time.
    HealthCheckDeadlineExceeded,
    /// The replacement reported `failing`.
    HealthCheckFailed,
    /// The provider did not confirm a disk move.
    DiskMigration,
    /// The task was cancelled.
    Cancelled,
    /// The update machine itself misbehaved.
    Internal,
}

impl ErrorKind {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProviderError => "provider_error",
            Self::AgentTimeout => "agent_timeout",
            Self::AgentRejected => "agent_rejected",
            Self::HealthCheckDeadlineExceeded => "health_check_deadline_exceeded",
            Self::HealthCheckFailed => "health_check_failed",
            Self::DiskMigration => "disk_migration",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    const fn of_agent(error: &AgentError) -> Self {
        if error.is_retryable() {
            Self::AgentTimeout
        } else {
            Self::AgentRejected
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Why an instance update stopped.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UpdateError {
    /// The instance has no usable VM spec.
    #[error("instance spec is invalid: {0}")]
    Spec(#[source] ProviderError),
    /// The instance disappeared from the deployment.
    #[error("instance {0} is not part of the deployment")]
    UnknownInstance(String),
    /// A VM left by an interrupted swap could not be cleaned up.
    #[error("failed to remove vm {cid} left by an interrupted update: {source}")]
    StaleVm {
        /// Leftover VM.
        cid: VmCid,
        /// Delete failure.
        #[source]
        source: VmError,
    },
    /// A VM left by an interrupted swap still holds a disk.
    #[error("vm {cid} left by an interrupted update still holds disk {disk}")]
    StaleVmHoldsDisk {
        /// Leftover VM.
        cid: VmCid,
        /// Disk attached to it.
        disk: DiskCid,
    },
    /// The replacement VM could not be created.
    #[error(transparent)]
    CreateVm(#[from] VmError),
    /// Disks could not be moved to the replacement.
    #[error("disk migration failed: {0}")]
    Disks(#[from] MigrationFailure),
    /// An agent command failed.
    #[error("{state}: {source}")]
    Agent {
        /// Step that sent the command.
        state: UpdateState,
        /// Agent failure.
        #[source]
        source: AgentError,
    },
    /// The replacement did not report `running` in time.
    #[error("vm {vm} did not report running within {watch_time:?} (last state: {last_state})")]
    HealthCheckDeadlineExceeded {
        /// Replacement VM.
        vm: VmCid,
        /// Watch time that elapsed.
        watch_time: Duration,
        /// Last state observed, if any.
        last_state: LastState,
    },
    /// The replacement reported failing jobs.
    #[error("vm {vm} reported {state}")]
    Unhealthy {
        /// Replacement VM.
        vm: VmCid,
        /// State reported.
        state: ProcessState,
    },
    /// The previous VM could not be deleted after the swap.
    #[error("failed to decommission old vm: {0}")]
    Decommission(#[source] VmError),
    /// The task was cancelled while the instance was in `state`.
    #[error("cancelled during {state}")]
    Cancelled {
        /// State at cancellation.
        state: UpdateState,
    },
    /// The machine tried a transition outside its table.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

/// Last state seen while waiting for health, for error messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LastState(pub Option<ProcessState>);

impl fmt::Display for LastState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(state) => write!(formatter, "{state}"),
            None => formatter.write_str("none reported"),
        }
    }
}

impl UpdateError {
    /// Terminal error kind for reporting.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spec(_)
            | Self::StaleVm { .. }
            | Self::CreateVm(_)
            | Self::Decommission(_) => ErrorKind::ProviderError,
            Self::StaleVmHoldsDisk { .. } => ErrorKind::DiskMigration,
            Self::UnknownInstance(_) | Self::IllegalTransition(_) => ErrorKind::Internal,
            Self::Disks(failure) => failure
                .error
                .agent_error()
                .map(ErrorKind::of_agent)
                .or_else(|| failure.error.provider_error().map(|_| ErrorKind::ProviderError))
                .unwrap_or(ErrorKind::DiskMigration),
            Self::Agent { source, .. } => ErrorKind::of_agent(source),
            Self::HealthCheckDeadlineExceeded { .. } => ErrorKind::HealthCheckDeadlineExceeded,
            Self::Unhealthy { .. } => ErrorKind::HealthCheckFailed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}
