//! States of a hot-swap and the transitions allowed between them.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Where an instance is in its hot-swap.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Admitted, nothing done yet.
    Pending,
    /// Creating the replacement VM.
    CreatingVm,
    /// Moving persistent disks to the replacement VM.
    MigratingDisks,
    /// Delivering packages and configuration to the replacement agent.
    Updating,
    /// Polling the replacement agent until its jobs run.
    WaitingHealthy,
    /// Stopping and deleting the previous VM.
    DecommissioningOldVm,
    /// Swap complete.
    Done,
    /// Swap abandoned.
    Failed,
}

/// Raised when a transition is not in the table.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("illegal update transition {from} -> {to}")]
pub struct IllegalTransition {
    /// State being left.
    pub from: UpdateState,
    /// State requested.
    pub to: UpdateState,
}

impl UpdateState {
    /// Every state in sequence order.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::CreatingVm,
        Self::MigratingDisks,
        Self::Updating,
        Self::WaitingHealthy,
        Self::DecommissioningOldVm,
        Self::Done,
        Self::Failed,
    ];

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CreatingVm => "creating_vm",
            Self::MigratingDisks => "migrating_disks",
            Self::Updating => "updating",
            Self::WaitingHealthy => "waiting_healthy",
            Self::DecommissioningOldVm => "decommissioning_old_vm",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether a failure in this state is unwound so the previous VM keeps
    /// serving. Once decommissioning starts the replacement is authoritative.
    #[must_use]
    pub const fn rolls_back(self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::CreatingVm
                | Self::MigratingDisks
                | Self::Updating
                | Self::WaitingHealthy
        )
    }

    /// Next state on success. Instances without disks skip
    /// [`Self::MigratingDisks`].
    #[must_use]
    pub const fn successor(self, has_disks: bool) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::CreatingVm),
            Self::CreatingVm if has_disks => Some(Self::MigratingDisks),
            Self::CreatingVm | Self::MigratingDisks => Some(Self::Updating),
            Self::Updating => Some(Self::WaitingHealthy),
            Self::WaitingHealthy => Some(Self::DecommissioningOldVm),
            Self::DecommissioningOldVm => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Whether `self -> next` is in the transition table.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::CreatingVm)
                | (Self::CreatingVm, Self::MigratingDisks | Self::Updating)
                | (Self::MigratingDisks, Self::Updating)
                | (Self::Updating, Self::WaitingHealthy)
                | (Self::WaitingHealthy, Self::DecommissioningOldVm)
                | (Self::DecommissioningOldVm, Self::Done)
                | (
                    Self::Pending
                        | Self::CreatingVm
                        | Self::MigratingDisks
                        | Self::Updating
                        | Self::WaitingHealthy
                        | Self::DecommissioningOldVm,
                    Self::Failed
                )
        )
    }

    /// Validates and performs `self -> next`.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] when the pair is not in the table.
    pub const fn transition(self, next: Self) -> Result<Self, IllegalTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
