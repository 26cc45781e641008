//! Disk Migrator: moves an instance's persistent disks between VMs.
//!
//! Disks move one at a time and each move holds a per-disk lock, so two
//! migrations can never race on the same disk. A migration either ends with
//! every disk attached to and mounted on the destination, or it is unwound in
//! reverse order so each disk is back on the VM that held it when the call
//! began. Disks whose unwinding fails are reported individually so an
//! operator can reconcile them.

mod mode;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentCommand, AgentError, AgentMessenger, AgentTransport};
use crate::backend::{DiskProvisioner, ProviderError};
use crate::model::{Disk, Vm};
use crate::types::{DiskCid, VmCid};

pub use mode::{DiskAttachMode, UnknownAttachMode};

/// Errors raised while moving a single disk.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiskError {
    /// Raised when the provider refuses to attach the disk.
    #[error("failed to attach disk {disk} to vm {vm}: {source}")]
    Attach {
        /// Disk being moved.
        disk: DiskCid,
        /// Destination VM.
        vm: VmCid,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the provider refuses to detach the disk.
    #[error("failed to detach disk {disk} from vm {vm}: {source}")]
    Detach {
        /// Disk being moved.
        disk: DiskCid,
        /// Source VM.
        vm: VmCid,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when the provider does not confirm an attachment it accepted.
    #[error("disk {disk} is not reported attached to vm {vm} after attach")]
    NotAttached {
        /// Disk being moved.
        disk: DiskCid,
        /// Destination VM.
        vm: VmCid,
    },
    /// Raised when the destination agent does not acknowledge `mount_disk`.
    #[error("agent on vm {vm} did not mount disk {disk}: {source}")]
    Mount {
        /// Disk being moved.
        disk: DiskCid,
        /// Destination VM.
        vm: VmCid,
        /// Agent failure.
        #[source]
        source: AgentError,
    },
    /// Raised when the source agent refuses to release the disk.
    #[error("agent on vm {vm} refused to unmount disk {disk}: {source}")]
    Unmount {
        /// Disk being moved.
        disk: DiskCid,
        /// Source VM.
        vm: VmCid,
        /// Agent failure.
        #[source]
        source: AgentError,
    },
}

impl DiskError {
    /// Agent failure behind this error, if any.
    #[must_use]
    pub const fn agent_error(&self) -> Option<&AgentError> {
        match self {
            Self::Mount { source, .. } | Self::Unmount { source, .. } => Some(source),
            Self::Attach { .. } | Self::Detach { .. } | Self::NotAttached { .. } => None,
        }
    }

    /// Provider failure behind this error, if any.
    #[must_use]
    pub const fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Attach { source, .. } | Self::Detach { source, .. } => Some(source),
            Self::NotAttached { .. } | Self::Mount { .. } | Self::Unmount { .. } => None,
        }
    }
}

/// A disk that could not be returned to its previous VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UnreconciledDisk {
    /// Disk needing attention.
    pub disk: DiskCid,
    /// VMs the provider reports the disk attached to.
    pub attached_to: Vec<VmCid>,
    /// What went wrong while unwinding.
    pub reason: String,
}

/// A failed migration after unwinding.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{error}")]
pub struct MigrationFailure {
    /// Failure that stopped the migration.
    #[source]
    pub error: DiskError,
    /// Disks that could not be unwound.
    pub unreconciled: Vec<UnreconciledDisk>,
}

/// Result of a completed migration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MigrationReport {
    /// Disks now attached to and mounted on the destination, in move order.
    pub moved: Vec<DiskCid>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Progress {
    Untouched,
    Unmounted,
    Detached,
    Attached,
    Mounted,
}

type DiskLock = Arc<tokio::sync::Mutex<()>>;

/// Moves disks between VMs with the provider and the agents.
#[derive(Debug)]
pub struct DiskMigrator<P, T> {
    provider: Arc<P>,
    messenger: AgentMessenger<T>,
    mode: DiskAttachMode,
    locks: Arc<Mutex<HashMap<DiskCid, DiskLock>>>,
}

impl<P, T> Clone for DiskMigrator<P, T> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            messenger: self.messenger.clone(),
            mode: self.mode,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<P: DiskProvisioner, T: AgentTransport> DiskMigrator<P, T> {
    /// Creates a migrator that picks its attach strategy from the provider.
    #[must_use]
    pub fn new(provider: Arc<P>, messenger: AgentMessenger<T>) -> Self {
        Self {
            provider,
            messenger,
            mode: DiskAttachMode::Provider,
            locks: Arc::default(),
        }
    }

    /// Overrides the attach strategy.
    #[must_use]
    pub const fn with_mode(mut self, mode: DiskAttachMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether disks are attached to the destination before leaving the
    /// source.
    #[must_use]
    pub fn attaches_concurrently(&self) -> bool {
        let multi_attach = self.provider.supports_multi_attach();
        match self.mode {
            DiskAttachMode::Serialized => false,
            DiskAttachMode::Provider => multi_attach,
            DiskAttachMode::Concurrent => {
                if !multi_attach {
                    warn!("provider cannot attach a disk twice; moving disks serially");
                }
                multi_attach
            }
        }
    }

    fn lock_for(&self, disk: &DiskCid) -> DiskLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(disk.clone()).or_default())
    }

    /// Moves every disk in `disks` from `from` (if any) to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationFailure`] when a disk could not be moved. Disks moved
    /// earlier in the call are moved back before returning; any that could not
    /// be are listed in [`MigrationFailure::unreconciled`].
    pub async fn migrate(
        &self,
        disks: &[Disk],
        from: Option<&Vm>,
        to: &Vm,
    ) -> Result<MigrationReport, MigrationFailure> {
        let concurrent = self.attaches_concurrently();
        let mut report = MigrationReport::default();
        for disk in disks {
            let lock = self.lock_for(&disk.cid);
            let held = lock.lock().await;
            let mut progress = Progress::Untouched;
            let moved = if concurrent {
                self.move_concurrently(&disk.cid, from, to, &mut progress).await
            } else {
                self.move_serially(&disk.cid, from, to, &mut progress).await
            };
            if let Err(error) = moved {
                warn!(disk_cid = %disk.cid, vm_cid = %to.cid, error = %error, "disk migration failed; unwinding");
                drop(held);
                let mut unreconciled = Vec::new();
                if let Some(entry) = self.unwind(&disk.cid, progress, from, to).await {
                    unreconciled.push(entry);
                }
                unreconciled.extend(self.move_back(&report.moved, to, from).await);
                return Err(MigrationFailure { error, unreconciled });
            }
            drop(held);
            info!(disk_cid = %disk.cid, vm_cid = %to.cid, "disk migrated");
            report.moved.push(disk.cid.clone());
        }
        Ok(report)
    }

    async fn move_serially(
        &self,
        disk: &DiskCid,
        from: Option<&Vm>,
        to: &Vm,
        progress: &mut Progress,
    ) -> Result<(), DiskError> {
        if let Some(source) = from {
            self.release(disk, source).await?;
            *progress = Progress::Unmounted;
            self.detach(disk, &source.cid).await?;
            *progress = Progress::Detached;
        }
        self.attach(disk, &to.cid).await?;
        *progress = Progress::Attached;
        self.mount(disk, to).await?;
        *progress = Progress::Mounted;
        Ok(())
    }

    async fn move_concurrently(
        &self,
        disk: &DiskCid,
        from: Option<&Vm>,
        to: &Vm,
        progress: &mut Progress,
    ) -> Result<(), DiskError> {
        self.attach(disk, &to.cid).await?;
        *progress = Progress::Attached;
        self.mount(disk, to).await?;
        *progress = Progress::Mounted;
        if let Some(source) = from {
            self.release(disk, source).await?;
            self.detach(disk, &source.cid).await?;
        }
        Ok(())
    }

    async fn attach(&self, disk: &DiskCid, vm: &VmCid) -> Result<(), DiskError> {
        self.provider
            .attach_disk(vm, disk)
            .await
            .map_err(|source| DiskError::Attach {
                disk: disk.clone(),
                vm: vm.clone(),
                source,
            })?;
        match self.provider.is_disk_attached(vm, disk).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DiskError::NotAttached {
                disk: disk.clone(),
                vm: vm.clone(),
            }),
            Err(source) => Err(DiskError::Attach {
                disk: disk.clone(),
                vm: vm.clone(),
                source,
            }),
        }
    }

    async fn detach(&self, disk: &DiskCid, vm: &VmCid) -> Result<(), DiskError> {
        self.provider
            .detach_disk(vm, disk)
            .await
            .map_err(|source| DiskError::Detach {
                disk: disk.clone(),
                vm: vm.clone(),
                source,
            })
    }

    async fn mount(&self, disk: &DiskCid, vm: &Vm) -> Result<(), DiskError> {
        self.messenger
            .send_with_retry(&vm.agent_id, &AgentCommand::MountDisk(disk.clone()))
            .await
            .map(drop)
            .map_err(|source| DiskError::Mount {
                disk: disk.clone(),
                vm: vm.cid.clone(),
                source,
            })
    }

    /// Asks the source agent to unmount. An unreachable agent does not stop
    /// the move; an explicit refusal does.
    async fn release(&self, disk: &DiskCid, vm: &Vm) -> Result<(), DiskError> {
        match self
            .messenger
            .send_with_retry(&vm.agent_id, &AgentCommand::UnmountDisk(disk.clone()))
            .await
        {
            Ok(_) => Ok(()),
            Err(source) if source.is_retryable() => {
                warn!(disk_cid = %disk, vm_cid = %vm.cid, error = %source, "source agent unreachable; detaching without unmount");
                Ok(())
            }
            Err(source) => Err(DiskError::Unmount {
                disk: disk.clone(),
                vm: vm.cid.clone(),
                source,
            }),
        }
    }

    /// Returns a partially moved disk to `from`.
    async fn unwind(
        &self,
        disk: &DiskCid,
        progress: Progress,
        from: Option<&Vm>,
        to: &Vm,
    ) -> Option<UnreconciledDisk> {
        let lock = self.lock_for(disk);
        let _held = lock.lock().await;
        let mut problems = Vec::new();

        if matches!(progress, Progress::Attached | Progress::Mounted) {
            if progress == Progress::Mounted
                && let Err(err) = self
                    .messenger
                    .send_with_retry(&to.agent_id, &AgentCommand::UnmountDisk(disk.clone()))
                    .await
            {
                warn!(disk_cid = %disk, vm_cid = %to.cid, error = %err, "unmount on new vm failed");
            }
            if let Err(err) = self.detach(disk, &to.cid).await {
                problems.push(err.to_string());
            }
        }

        if let Some(source) = from
            && progress != Progress::Untouched
        {
            if !matches!(self.provider.is_disk_attached(&source.cid, disk).await, Ok(true))
                && let Err(err) = self.attach(disk, &source.cid).await
            {
                problems.push(err.to_string());
            }
            if problems.is_empty()
                && let Err(err) = self.mount(disk, source).await
            {
                problems.push(err.to_string());
            }
        }

        if problems.is_empty() {
            info!(disk_cid = %disk, "disk returned to previous vm");
            return None;
        }
        Some(UnreconciledDisk {
            disk: disk.clone(),
            attached_to: self.holders(disk, from, to).await,
            reason: problems.join("; "),
        })
    }

    /// Moves fully migrated disks back from `to` to `from`, last first.
    async fn move_back(&self, moved: &[DiskCid], to: &Vm, from: Option<&Vm>) -> Vec<UnreconciledDisk> {
        let mut unreconciled = Vec::new();
        for disk in moved.iter().rev() {
            if let Some(entry) = self.unwind(disk, Progress::Mounted, from, to).await {
                unreconciled.push(entry);
            }
        }
        unreconciled
    }

    /// Returns `disks` from `current` to `previous` after a later step of the
    /// swap failed.
    ///
    /// Returns the disks that could not be moved back.
    pub async fn restore(&self, disks: &[Disk], current: &Vm, previous: Option<&Vm>) -> Vec<UnreconciledDisk> {
        let moved: Vec<DiskCid> = disks.iter().map(|disk| disk.cid.clone()).collect();
        self.move_back(&moved, current, previous).await
    }

    /// Whether the provider reports `disk` attached to `vm`. Lookup failures
    /// count as attached.
    pub async fn is_attached(&self, vm: &VmCid, disk: &DiskCid) -> bool {
        self.provider.is_disk_attached(vm, disk).await.unwrap_or(true)
    }

    /// VMs holding `disk` according to the provider. Falls back to probing
    /// `from` and `to` when the provider cannot list attachments.
    async fn holders(&self, disk: &DiskCid, from: Option<&Vm>, to: &Vm) -> Vec<VmCid> {
        match self.provider.disk_attachments(disk).await {
            Ok(holders) => return holders,
            Err(err) => warn!(disk_cid = %disk, error = %err, "could not list disk attachments"),
        }
        let mut holders = Vec::new();
        for vm in from.into_iter().chain(std::iter::once(to)) {
            if matches!(self.provider.is_disk_attached(&vm.cid, disk).await, Ok(true)) {
                holders.push(vm.cid.clone());
            }
        }
        holders
    }
}

#[cfg(test)]
mod tests;
