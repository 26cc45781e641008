//! End-to-end hot-swap run against the simulated cloud.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::agent::RecordedMessages;
use crate::backend::{NetworkRequest, ProviderError, ProviderOperation};
use crate::deployment::{Deployment, VmListing};
use crate::model::{ChangeSet, InstanceGroup, UpdateConfig};
use crate::orchestrator::{TaskReport, Timings, UpdateOrchestrator};

use super::{AgentBehaviour, SimulatedCloud};

/// Failure injected into the hot-swap deploy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Replacement agents refuse `mount_disk`.
    RejectMount,
    /// Replacement jobs report `failing` after start.
    FailHealth,
    /// The provider refuses to create the replacement VM.
    CreateError,
}

/// Shape of the simulated deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScenarioOptions {
    /// Instance group name.
    pub group: String,
    /// Number of instances.
    pub instances: usize,
    /// Persistent disk size in megabytes, if any.
    pub persistent_disk_mb: Option<u64>,
    /// Whether every instance needs a new VM.
    pub recreate: bool,
    /// Failure to inject, if any.
    pub fault: Option<Fault>,
    /// Delay added to every provider call and agent reply.
    pub latency: Duration,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            group: String::from("foobar"),
            instances: 1,
            persistent_disk_mb: None,
            recreate: true,
            fault: None,
            latency: Duration::ZERO,
        }
    }
}

/// Everything observed during a scenario run.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioOutcome {
    /// Task progress lines.
    pub task: Vec<String>,
    /// Task result.
    pub report: TaskReport,
    /// Instance listing after the task.
    pub vms: Vec<VmListing>,
    /// Largest number of VMs alive at once.
    pub peak_live_vms: usize,
    /// Agent methods sent during the deploy, in send order.
    #[serde(skip)]
    pub messages: RecordedMessages,
}

/// Deploys a baseline of `options.instances` VMs, then runs the hot-swap
/// deploy and reports what happened.
pub async fn run_scenario(options: &ScenarioOptions, update: &UpdateConfig, timings: Timings) -> ScenarioOutcome {
    let cloud = SimulatedCloud::new().with_latency(options.latency);
    let group = InstanceGroup {
        name: options.group.clone(),
        instances: options.instances,
        vm_type: String::from("a"),
        stemcell: String::from("ubuntu-noble"),
        availability_zone: String::new(),
        networks: vec![NetworkRequest::dynamic("a")],
        persistent_disk_mb: options.persistent_disk_mb,
        update: *update,
    };

    let deployment = Deployment::new("simple");
    let mut changes = ChangeSet::new();
    for instance in cloud.bootstrap(&group) {
        changes.push(instance.key(), options.recreate);
        deployment.insert(instance);
    }

    match options.fault {
        Some(Fault::RejectMount) => cloud.set_new_vm_behaviour(
            AgentBehaviour::default().reject("mount_disk", "device /dev/sdc is busy"),
        ),
        Some(Fault::FailHealth) => cloud.set_new_vm_behaviour(AgentBehaviour::default().failing_after_start()),
        Some(Fault::CreateError) => cloud.fail_next_create(ProviderError::Fatal {
            operation: ProviderOperation::CreateVm,
            message: String::from("quota exceeded"),
        }),
        None => {}
    }

    let shared = Arc::new(cloud.clone());
    let orchestrator = UpdateOrchestrator::new(Arc::clone(&shared), shared, deployment, timings);
    orchestrator.messenger().log().start_recording();
    let report = orchestrator.run(&changes, update).await;
    let messages = orchestrator.messenger().log().finish_recording();

    ScenarioOutcome {
        task: orchestrator.progress(),
        report,
        vms: orchestrator.list_vms(),
        peak_live_vms: cloud.peak_live_vms(),
        messages,
    }
}
