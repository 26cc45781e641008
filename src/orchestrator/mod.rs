//! Update Orchestrator: runs instance updates for a change-set.
//!
//! The orchestrator admits instance updates through a shared
//! [`AdmissionGate`] sized by `max_in_flight`, runs canaries before the rest
//! of the change-set, propagates cancellation, and folds every instance
//! outcome into a [`TaskReport`]. A failing instance never stops its
//! siblings.

mod admission;
mod report;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentMessenger, AgentTimeouts, AgentTransport};
use crate::backend::DiskProvisioner;
use crate::deployment::{Deployment, VmListing};
use crate::disk::{DiskAttachMode, DiskMigrator};
use crate::model::{ChangeSet, InstanceKey, UpdateConfig, UpdateStrategy};
use crate::status::TaskLog;
use crate::update::{Cancellation, InstanceUpdate, Slot, UpdateContext};
use crate::vm::{RetryPolicy, VmLifecycleManager};

pub use admission::{Admission, AdmissionGate};
pub use report::{InstanceOutcome, InstanceReport, TaskReport};

/// Timeouts, retry budgets and disk strategy used by a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Pause between health polls.
    pub health_poll_interval: Duration,
    /// Agent reply deadline and retry budget.
    pub agent: AgentTimeouts,
    /// VM creation retry budget.
    pub create: RetryPolicy,
    /// VM deletion retry budget.
    pub delete: RetryPolicy,
    /// How disks change hands.
    pub disk_attach_mode: DiskAttachMode,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(1),
            agent: AgentTimeouts::default(),
            create: RetryPolicy::new(3, Duration::from_secs(2)),
            delete: RetryPolicy::new(10, Duration::from_secs(2)),
            disk_attach_mode: DiskAttachMode::Provider,
        }
    }
}

/// Drives hot-swap updates across a deployment.
#[derive(Debug)]
pub struct UpdateOrchestrator<P, T> {
    ctx: Arc<UpdateContext<P, T>>,
}

impl<P, T> UpdateOrchestrator<P, T>
where
    P: DiskProvisioner + 'static,
    T: AgentTransport + 'static,
{
    /// Wires the lifecycle manager, disk migrator and messenger over
    /// `provider` and `transport`.
    #[must_use]
    pub fn new(provider: Arc<P>, transport: Arc<T>, deployment: Deployment, timings: Timings) -> Self {
        let messenger = AgentMessenger::new(transport).with_timeouts(timings.agent);
        let vms = VmLifecycleManager::new(Arc::clone(&provider)).with_retry(timings.create, timings.delete);
        let disks = DiskMigrator::new(provider, messenger.clone()).with_mode(timings.disk_attach_mode);
        let ctx = UpdateContext::new(
            deployment,
            vms,
            disks,
            messenger,
            TaskLog::new(),
            timings.health_poll_interval,
        );
        Self { ctx: Arc::new(ctx) }
    }

    /// Instance store.
    #[must_use]
    pub fn deployment(&self) -> &Deployment {
        self.ctx.deployment()
    }

    /// Agent messenger, including its message recorder.
    #[must_use]
    pub fn messenger(&self) -> &AgentMessenger<T> {
        self.ctx.messenger()
    }

    /// Task status log.
    #[must_use]
    pub fn status(&self) -> &TaskLog {
        self.ctx.status()
    }

    /// Progress lines emitted so far.
    #[must_use]
    pub fn progress(&self) -> Vec<String> {
        self.ctx.status().lines()
    }

    /// Instance listing surface.
    #[must_use]
    pub fn list_vms(&self) -> Vec<VmListing> {
        self.ctx.deployment().list_vms()
    }

    /// Registers the network reservations of every VM already in the
    /// deployment.
    fn adopt_existing(&self) {
        for instance in self.ctx.deployment().instances() {
            for vm in instance.active_vm.iter().chain(instance.incoming_vm.iter()) {
                if let Err(err) = self.ctx.vms().adopt(vm) {
                    warn!(instance = %instance.key(), vm_cid = %vm.cid, error = %err, "conflicting reservation on existing vm");
                }
            }
        }
    }

    /// Updates every instance of `changes` that needs recreation.
    pub async fn run(&self, changes: &ChangeSet, config: &UpdateConfig) -> TaskReport {
        self.run_cancellable(changes, config, &Cancellation::new()).await
    }

    /// Like [`Self::run`], stopping at the next checkpoint once
    /// `cancellation` fires. The handle is scoped to this task; later runs
    /// start uncancelled.
    pub async fn run_cancellable(
        &self,
        changes: &ChangeSet,
        config: &UpdateConfig,
        cancellation: &Cancellation,
    ) -> TaskReport {
        let keys: Vec<InstanceKey> = changes.requiring_recreate().cloned().collect();
        let mut report = TaskReport::default();
        if config.strategy == UpdateStrategy::InPlace {
            info!(instances = keys.len(), "in-place strategy selected; hot-swap not applied");
            report.instances = keys
                .iter()
                .map(|key| InstanceReport::skipped(key, "in-place strategy"))
                .collect();
            return report;
        }

        self.adopt_existing();
        let gate = AdmissionGate::new(config.max_in_flight);
        let canary_count = config.canaries.min(keys.len());
        let (canaries, rest) = keys.split_at(canary_count);
        let plan = Plan {
            gate: &gate,
            config,
            cancellation,
            total: keys.len(),
        };
        info!(deployment = self.ctx.deployment().name(), instances = keys.len(), canaries = canary_count, max_in_flight = config.max_in_flight.get(), "starting hot-swap task");

        self.run_batch(&plan, canaries, 0, true, &mut report).await;
        if report.unsuccessful().next().is_some() && !rest.is_empty() {
            warn!(remaining = rest.len(), "canary failed; leaving remaining instances untouched");
            report
                .instances
                .extend(rest.iter().map(|key| InstanceReport::skipped(key, "canary failed")));
        } else {
            self.run_batch(&plan, rest, canary_count, false, &mut report).await;
        }

        report.peak_in_flight = gate.peak();
        if report.is_success() {
            info!(instances = report.instances.len(), "hot-swap task succeeded");
        } else {
            warn!(failed = report.unsuccessful().count(), "hot-swap task finished with failures");
        }
        report
    }

    async fn run_batch(
        &self,
        plan: &Plan<'_>,
        keys: &[InstanceKey],
        offset: usize,
        canary: bool,
        report: &mut TaskReport,
    ) {
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();
        let mut skipped = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            let admitted = tokio::select! {
                biased;
                () = plan.cancellation.cancelled() => None,
                result = plan.gate.admit() => result.ok(),
            };
            let Some(admission) = admitted else {
                skipped.push((index, InstanceReport::skipped(key, "cancelled")));
                continue;
            };
            debug!(instance = %key, in_flight = plan.gate.in_flight(), "instance admitted");
            let slot = Slot {
                position: offset + index + 1,
                total: plan.total,
                canary,
            };
            let update = InstanceUpdate::new(
                Arc::clone(&self.ctx),
                key.clone(),
                slot,
                plan.config.watch_time(canary),
                plan.cancellation.clone(),
            );
            let handle = tasks.spawn(update.run(admission));
            spawned.insert(handle.id(), index);
        }

        let mut finished = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, run)) => {
                    let index = spawned.get(&id).copied().unwrap_or(usize::MAX);
                    finished.push((index, Some(run)));
                }
                Err(join_error) => {
                    error!(error = %join_error, "instance update task did not complete");
                    let index = spawned.get(&join_error.id()).copied().unwrap_or(usize::MAX);
                    finished.push((index, None));
                }
            }
        }
        finished.sort_by_key(|(index, _)| *index);

        let mut skipped = skipped.into_iter().peekable();
        for (index, outcome) in finished {
            while let Some((_, entry)) = skipped.next_if(|(position, _)| *position < index) {
                report.instances.push(entry);
            }
            match outcome {
                Some(run) => report.push_run(run),
                None => {
                    if let Some(key) = keys.get(index) {
                        report.instances.push(InstanceReport::crashed(key));
                    }
                }
            }
        }
        report.instances.extend(skipped.map(|(_, entry)| entry));
    }
}

struct Plan<'a> {
    gate: &'a AdmissionGate,
    config: &'a UpdateConfig,
    cancellation: &'a Cancellation,
    total: usize,
}
