//! Hot-swap update orchestration for instance groups.
//!
//! When an instance's VM must be recreated, the hot-swap strategy creates the
//! replacement VM first, moves persistent disks and configuration onto it,
//! waits for its jobs to run, and only then retires the original VM. The
//! crate exposes the provisioning and agent abstractions this relies on, the
//! per-instance state machine, and an orchestrator that runs many instance
//! updates under a concurrency bound.

pub mod agent;
pub mod backend;
pub mod config;
pub mod deployment;
pub mod disk;
pub mod model;
pub mod orchestrator;
pub mod sim;
pub mod status;
pub mod telemetry;
pub mod test_support;
pub mod types;
pub mod update;
pub mod vm;

pub use agent::{AgentError, AgentMessenger, AgentTransport};
pub use backend::{
    BackendFuture, CreatedVm, DiskProvisioner, NetworkRequest, ProviderError, Provisioner, VmSpec,
    VmSpecBuilder,
};
pub use config::{ConfigError, OrchestratorConfig};
pub use deployment::{Deployment, VmListing};
pub use disk::{DiskAttachMode, DiskError, DiskMigrator};
pub use model::{
    ChangeSet, Disk, Instance, InstanceGroup, InstanceKey, ProcessState, UpdateConfig,
    UpdateStrategy, Vm,
};
pub use orchestrator::{InstanceOutcome, TaskReport, Timings, UpdateOrchestrator};
pub use status::{StatusEvent, TaskLog};
pub use types::{AgentId, DiskCid, VmCid};
pub use update::{Cancellation, ErrorKind, UpdateError, UpdateState};
pub use vm::{VmError, VmLifecycleManager};
