//! Instance Update State Machine.
//!
//! [`InstanceUpdate`] carries one instance through the hot-swap sequence:
//! create the replacement VM, move disks, deliver configuration, wait for
//! health, then retire the previous VM. The current step is an explicit
//! [`UpdateState`]; each step runs to completion and the machine then
//! advances along the transition table. A failure before decommissioning is
//! unwound so the previous VM keeps serving. Cancellation is honoured between
//! steps and while waiting for health, never once decommissioning began.

mod cancel;
mod error;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentCommand, AgentMessenger, AgentTransport};
use crate::backend::{DiskProvisioner, VmSpec};
use crate::deployment::Deployment;
use crate::disk::{DiskMigrator, UnreconciledDisk};
use crate::model::{Disk, Instance, InstanceKey, ProcessState, Vm};
use crate::orchestrator::Admission;
use crate::status::{StatusEvent, TaskLog};
use crate::types::{DiskCid, VmCid};
use crate::vm::{VmError, VmLifecycleManager};

pub use cancel::Cancellation;
pub use error::{ErrorKind, LastState, UpdateError};
pub use state::{IllegalTransition, UpdateState};

/// Collaborators shared by every instance update of a task.
#[derive(Debug)]
pub struct UpdateContext<P, T> {
    deployment: Deployment,
    vms: VmLifecycleManager<P>,
    disks: DiskMigrator<P, T>,
    messenger: AgentMessenger<T>,
    status: TaskLog,
    poll_interval: Duration,
}

impl<P: DiskProvisioner, T: AgentTransport> UpdateContext<P, T> {
    /// Bundles the collaborators.
    #[must_use]
    pub const fn new(
        deployment: Deployment,
        vms: VmLifecycleManager<P>,
        disks: DiskMigrator<P, T>,
        messenger: AgentMessenger<T>,
        status: TaskLog,
        poll_interval: Duration,
    ) -> Self {
        Self {
            deployment,
            vms,
            disks,
            messenger,
            status,
            poll_interval,
        }
    }

    /// Instance store.
    #[must_use]
    pub const fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// VM lifecycle manager.
    #[must_use]
    pub const fn vms(&self) -> &VmLifecycleManager<P> {
        &self.vms
    }

    /// Agent messenger.
    #[must_use]
    pub const fn messenger(&self) -> &AgentMessenger<T> {
        &self.messenger
    }

    /// Task status log.
    #[must_use]
    pub const fn status(&self) -> &TaskLog {
        &self.status
    }
}

/// Where an instance sits in the task, for progress lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot {
    /// One-based position in the change-set.
    pub position: usize,
    /// Size of the change-set.
    pub total: usize,
    /// Whether the instance is a canary.
    pub canary: bool,
}

/// Result of one instance update.
#[derive(Debug)]
pub struct UpdateRun {
    /// Instance updated.
    pub key: InstanceKey,
    /// States entered, in order.
    pub history: Vec<UpdateState>,
    /// Terminal failure, if any.
    pub error: Option<UpdateError>,
    /// Problems met while unwinding a failure.
    pub rollback_notes: Vec<String>,
    /// VMs that could not be deleted.
    pub orphaned_vms: Vec<VmCid>,
    /// Disks that could not be returned to the previous VM.
    pub unreconciled_disks: Vec<UnreconciledDisk>,
}

impl UpdateRun {
    /// Terminal state reached.
    #[must_use]
    pub fn final_state(&self) -> UpdateState {
        self.history.last().copied().unwrap_or(UpdateState::Pending)
    }

    /// Failure description including any rollback problems.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .map(|err| append_rollback_note(err.to_string(), &self.rollback_notes))
    }
}

fn append_rollback_note(message: String, notes: &[String]) -> String {
    if notes.is_empty() {
        message
    } else {
        format!("{message} (rollback also failed: {})", notes.join("; "))
    }
}

/// Hot-swap of one instance.
#[derive(Debug)]
pub struct InstanceUpdate<P, T> {
    ctx: Arc<UpdateContext<P, T>>,
    key: InstanceKey,
    slot: Slot,
    watch_time: Duration,
    cancellation: Cancellation,
    state: UpdateState,
    history: Vec<UpdateState>,
    instance: Option<Instance>,
    spec: Option<VmSpec>,
    old_vm: Option<Vm>,
    new_vm: Option<Vm>,
    disks: Vec<Disk>,
    disks_moved: bool,
    orphaned_vms: Vec<VmCid>,
    unreconciled: Vec<UnreconciledDisk>,
}

impl<P, T> InstanceUpdate<P, T>
where
    P: DiskProvisioner + 'static,
    T: AgentTransport + 'static,
{
    /// Prepares an update of `key` in state [`UpdateState::Pending`].
    #[must_use]
    pub fn new(
        ctx: Arc<UpdateContext<P, T>>,
        key: InstanceKey,
        slot: Slot,
        watch_time: Duration,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            ctx,
            key,
            slot,
            watch_time,
            cancellation,
            state: UpdateState::Pending,
            history: vec![UpdateState::Pending],
            instance: None,
            spec: None,
            old_vm: None,
            new_vm: None,
            disks: Vec::new(),
            disks_moved: false,
            orphaned_vms: Vec::new(),
            unreconciled: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> UpdateState {
        self.state
    }

    /// Runs the update to a terminal state. `admission` is released when the
    /// terminal state is reached.
    pub async fn run(mut self, admission: Admission) -> UpdateRun {
        let name = self.key.to_string();
        let outcome = self.drive().await;
        let mut notes = Vec::new();
        let error = match outcome {
            Ok(()) => {
                self.ctx.status.record(StatusEvent::Finished { instance: name });
                None
            }
            Err(err) => {
                notes = self.abandon(&err).await;
                self.ctx.status.record(StatusEvent::Failed {
                    instance: name,
                    message: append_rollback_note(err.to_string(), &notes),
                });
                Some(err)
            }
        };
        drop(admission);
        UpdateRun {
            key: self.key,
            history: self.history,
            error,
            rollback_notes: notes,
            orphaned_vms: self.orphaned_vms,
            unreconciled_disks: self.unreconciled,
        }
    }

    async fn drive(&mut self) -> Result<(), UpdateError> {
        loop {
            if self.state.is_terminal() {
                return Ok(());
            }
            if self.state.rolls_back() && self.cancellation.is_cancelled() {
                return Err(UpdateError::Cancelled { state: self.state });
            }
            self.perform().await?;
            match self.state.successor(!self.disks.is_empty()) {
                Some(next) => self.enter(next)?,
                None => return Ok(()),
            }
        }
    }

    fn enter(&mut self, next: UpdateState) -> Result<(), IllegalTransition> {
        self.state = self.state.transition(next)?;
        self.history.push(next);
        debug!(instance = %self.key, state = %next, "entered update state");
        Ok(())
    }

    async fn perform(&mut self) -> Result<(), UpdateError> {
        match self.state {
            UpdateState::Pending => self.prepare().await,
            UpdateState::CreatingVm => self.create_vm().await,
            UpdateState::MigratingDisks => self.migrate_disks().await,
            UpdateState::Updating => self.deliver().await,
            UpdateState::WaitingHealthy => self.await_healthy().await,
            UpdateState::DecommissioningOldVm => self.decommission().await,
            UpdateState::Done | UpdateState::Failed => Ok(()),
        }
    }

    fn unknown(&self) -> UpdateError {
        UpdateError::UnknownInstance(self.key.to_string())
    }

    async fn prepare(&mut self) -> Result<(), UpdateError> {
        let instance = self
            .ctx
            .deployment
            .get(&self.key)
            .ok_or_else(|| self.unknown())?;
        self.spec = Some(instance.vm_spec().map_err(UpdateError::Spec)?);
        self.old_vm.clone_from(&instance.active_vm);
        self.disks.clone_from(&instance.disks);
        if let Some(stale) = &instance.incoming_vm {
            self.clear_stale(stale).await?;
        }
        self.instance = Some(instance);
        Ok(())
    }

    /// Deletes a replacement VM left by an interrupted update, unless it holds
    /// one of the instance's disks.
    async fn clear_stale(&self, stale: &Vm) -> Result<(), UpdateError> {
        for disk in &self.disks {
            if self.ctx.disks.is_attached(&stale.cid, &disk.cid).await {
                return Err(UpdateError::StaleVmHoldsDisk {
                    cid: stale.cid.clone(),
                    disk: disk.cid.clone(),
                });
            }
        }
        warn!(instance = %self.key, vm_cid = %stale.cid, "removing vm left by an interrupted update");
        self.ctx
            .vms
            .delete(stale)
            .await
            .map_err(|source| UpdateError::StaleVm {
                cid: stale.cid.clone(),
                source,
            })?;
        self.ctx.messenger.forget(&stale.agent_id);
        self.ctx.deployment.update(&self.key, |instance| {
            instance.incoming_vm = None;
        });
        Ok(())
    }

    async fn create_vm(&mut self) -> Result<(), UpdateError> {
        let spec = self.spec.clone().ok_or_else(|| self.unknown())?;
        self.ctx.status.record(StatusEvent::CreatingMissingVm {
            instance: self.key.to_string(),
        });
        let vm = self.ctx.vms.create(&spec).await?;
        self.ctx.deployment.update(&self.key, |instance| {
            instance.incoming_vm = Some(vm.clone());
        });
        let agent_id = vm.agent_id.clone();
        self.new_vm = Some(vm);
        self.ctx
            .messenger
            .send_with_retry(&agent_id, &AgentCommand::GetState)
            .await
            .map_err(|source| UpdateError::Agent {
                state: UpdateState::CreatingVm,
                source,
            })?;
        Ok(())
    }

    fn replacement(&self) -> Result<Vm, UpdateError> {
        self.new_vm.clone().ok_or_else(|| self.unknown())
    }

    async fn migrate_disks(&mut self) -> Result<(), UpdateError> {
        let target = self.replacement()?;
        match self
            .ctx
            .disks
            .migrate(&self.disks, self.old_vm.as_ref(), &target)
            .await
        {
            Ok(report) => {
                info!(instance = %self.key, vm_cid = %target.cid, disks = report.moved.len(), "disks moved to replacement vm");
                self.disks_moved = true;
                Ok(())
            }
            Err(failure) => {
                self.unreconciled.extend(failure.unreconciled.iter().cloned());
                Err(failure.into())
            }
        }
    }

    async fn send(&self, vm: &Vm, command: AgentCommand) -> Result<(), UpdateError> {
        self.ctx
            .messenger
            .send_with_retry(&vm.agent_id, &command)
            .await
            .map(drop)
            .map_err(|source| UpdateError::Agent {
                state: self.state,
                source,
            })
    }

    async fn deliver(&mut self) -> Result<(), UpdateError> {
        let target = self.replacement()?;
        let spec = self
            .instance
            .as_ref()
            .map(|instance| instance.apply_spec(&target))
            .ok_or_else(|| self.unknown())?;
        let name = self.key.to_string();

        self.ctx.status.record(StatusEvent::DownloadingPackages {
            instance: name.clone(),
        });
        self.send(&target, AgentCommand::Prepare(spec.clone())).await?;

        self.ctx.status.record(StatusEvent::UpdatingInstance {
            group: self.key.group.clone(),
            instance: name,
            position: self.slot.position,
            total: self.slot.total,
            canary: self.slot.canary,
        });
        self.send(&target, AgentCommand::Apply(spec)).await?;
        self.send(&target, AgentCommand::Start).await
    }

    async fn await_healthy(&mut self) -> Result<(), UpdateError> {
        let target = self.replacement()?;
        let deadline = Instant::now() + self.watch_time;
        let mut last = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UpdateError::HealthCheckDeadlineExceeded {
                    vm: target.cid,
                    watch_time: self.watch_time,
                    last_state: LastState(last),
                });
            }
            match timeout(remaining, self.ctx.messenger.get_state(&target.agent_id)).await {
                Ok(Ok(reported)) => {
                    last = Some(reported);
                    self.ctx.deployment.update(&self.key, |instance| {
                        if let Some(incoming) = instance.incoming_vm.as_mut() {
                            incoming.process_state = reported;
                        }
                    });
                    match reported {
                        ProcessState::Running => {
                            info!(instance = %self.key, vm_cid = %target.cid, "replacement vm is running");
                            if let Some(vm) = self.new_vm.as_mut() {
                                vm.process_state = ProcessState::Running;
                            }
                            return Ok(());
                        }
                        ProcessState::Failing => {
                            return Err(UpdateError::Unhealthy {
                                vm: target.cid,
                                state: reported,
                            });
                        }
                        ProcessState::Starting | ProcessState::Unresponsive | ProcessState::Stopped => {}
                    }
                }
                Ok(Err(err)) if err.is_retryable() => {
                    debug!(instance = %self.key, error = %err, "health poll unanswered");
                }
                Ok(Err(source)) => {
                    return Err(UpdateError::Agent {
                        state: self.state,
                        source,
                    });
                }
                Err(_) => continue,
            }
            let pause = self.ctx.poll_interval.min(remaining);
            tokio::select! {
                () = sleep(pause) => {}
                () = self.cancellation.cancelled() => {
                    return Err(UpdateError::Cancelled { state: self.state });
                }
            }
        }
    }

    /// Stops the previous VM's jobs without letting an unresponsive agent
    /// hold up deletion.
    async fn quiesce(&self, old: &Vm) {
        let deadline = self.ctx.messenger.timeouts().reply;
        for command in [AgentCommand::Drain, AgentCommand::Stop] {
            if let Err(err) = self.ctx.messenger.send(&old.agent_id, &command, deadline).await {
                warn!(instance = %self.key, vm_cid = %old.cid, method = command.method(), error = %err, "old vm did not stop gracefully");
            }
        }
    }

    async fn decommission(&mut self) -> Result<(), UpdateError> {
        let mut promoted = self.replacement()?;
        promoted.process_state = ProcessState::Running;
        let deleted = match self.old_vm.clone() {
            Some(old) => {
                self.quiesce(&old).await;
                let deleted = self.ctx.vms.delete(&old).await;
                if deleted.is_ok() {
                    self.ctx.messenger.forget(&old.agent_id);
                }
                deleted
            }
            None => Ok(()),
        };
        self.ctx.deployment.update(&self.key, |instance| {
            instance.active_vm = Some(promoted);
            instance.incoming_vm = None;
        });
        deleted.map_err(|err| {
            self.record_leak(&err);
            UpdateError::Decommission(err)
        })?;
        info!(instance = %self.key, "hot-swap complete");
        Ok(())
    }

    fn record_leak(&mut self, err: &VmError) {
        if let VmError::Leaked { cid, .. } = err {
            self.orphaned_vms.push(cid.clone());
        }
    }

    /// Moves to [`UpdateState::Failed`], unwinding first when the failure
    /// happened before decommissioning. Returns rollback problems.
    async fn abandon(&mut self, err: &UpdateError) -> Vec<String> {
        let failed_in = self.state;
        warn!(instance = %self.key, state = %failed_in, kind = %err.kind(), error = %err, "instance update failed");
        let notes = if failed_in.rolls_back() {
            self.roll_back().await
        } else {
            Vec::new()
        };
        if let Err(illegal) = self.enter(UpdateState::Failed) {
            error!(instance = %self.key, error = %illegal, "forcing failed state");
            self.state = UpdateState::Failed;
            self.history.push(UpdateState::Failed);
        }
        notes
    }

    async fn roll_back(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let Some(replacement) = self.new_vm.clone() else {
            return notes;
        };

        if self.disks_moved {
            let unreconciled = self
                .ctx
                .disks
                .restore(&self.disks, &replacement, self.old_vm.as_ref())
                .await;
            self.unreconciled.extend(unreconciled);
        }
        notes.extend(
            self.unreconciled
                .iter()
                .map(|entry| format!("disk {} needs reconciliation: {}", entry.disk, entry.reason)),
        );

        if let Some(disk) = self.disk_held_only_by(&replacement).await {
            warn!(instance = %self.key, vm_cid = %replacement.cid, disk_cid = %disk, "keeping replacement vm: it is the only holder of a disk");
            notes.push(format!(
                "vm {} kept because it is the only vm holding disk {disk}",
                replacement.cid
            ));
            return notes;
        }

        match self.ctx.vms.delete(&replacement).await {
            Ok(()) => {
                self.ctx.messenger.forget(&replacement.agent_id);
                self.ctx.deployment.update(&self.key, |instance| {
                    instance.incoming_vm = None;
                });
                info!(instance = %self.key, vm_cid = %replacement.cid, "rolled back replacement vm");
            }
            Err(err) => {
                self.record_leak(&err);
                notes.push(err.to_string());
            }
        }
        notes
    }

    async fn disk_held_only_by(&self, replacement: &Vm) -> Option<DiskCid> {
        for disk in &self.disks {
            if !self.ctx.disks.is_attached(&replacement.cid, &disk.cid).await {
                continue;
            }
            let previous_holds = match &self.old_vm {
                Some(old) => self.ctx.disks.is_attached(&old.cid, &disk.cid).await,
                None => false,
            };
            if !previous_holds {
                return Some(disk.cid.clone());
            }
        }
        None
    }
}
