//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::agent::AgentTimeouts;
use crate::backend::NetworkRequest;
use crate::deployment::Deployment;
use crate::disk::DiskAttachMode;
use crate::model::{ChangeSet, Instance, InstanceGroup, InstanceKey, UpdateConfig};
use crate::orchestrator::{Timings, UpdateOrchestrator};
use crate::sim::SimulatedCloud;
use crate::vm::RetryPolicy;

/// Orchestrator wired to the simulated cloud for both provider and agents.
pub type SimOrchestrator = UpdateOrchestrator<SimulatedCloud, SimulatedCloud>;

/// Timings scaled down so failure paths finish in milliseconds.
#[must_use]
pub const fn fast_timings() -> Timings {
    Timings {
        health_poll_interval: Duration::from_millis(5),
        agent: AgentTimeouts {
            reply: Duration::from_millis(200),
            attempts: 2,
            backoff: Duration::from_millis(1),
        },
        create: RetryPolicy::new(2, Duration::from_millis(1)),
        delete: RetryPolicy::new(2, Duration::from_millis(1)),
        disk_attach_mode: DiskAttachMode::Provider,
    }
}

/// Hot-swap configuration without canaries and with a one second watch time.
#[must_use]
pub fn fast_update_config(max_in_flight: usize) -> UpdateConfig {
    UpdateConfig::hot_swap(NonZeroUsize::new(max_in_flight).unwrap_or(NonZeroUsize::MIN))
        .with_watch_times(Duration::from_secs(1), Duration::from_secs(1))
}

/// Instance group on one dynamic network, optionally with a persistent disk.
#[must_use]
pub fn instance_group(name: &str, instances: usize, persistent_disk_mb: Option<u64>) -> InstanceGroup {
    InstanceGroup {
        name: name.to_owned(),
        instances,
        vm_type: String::from("a"),
        stemcell: String::from("ubuntu-noble"),
        availability_zone: String::new(),
        networks: vec![NetworkRequest::dynamic("a")],
        persistent_disk_mb,
        update: fast_update_config(1),
    }
}

/// A deployed group running on a [`SimulatedCloud`], ready to be updated.
#[derive(Clone, Debug)]
pub struct SimDeployment {
    /// Cloud backing the deployment.
    pub cloud: SimulatedCloud,
    /// Instance store.
    pub deployment: Deployment,
    /// Instances as first deployed, in index order.
    pub instances: Vec<Instance>,
}

impl SimDeployment {
    /// Deploys `group` onto `cloud`.
    #[must_use]
    pub fn deploy(cloud: SimulatedCloud, group: &InstanceGroup) -> Self {
        let deployment = Deployment::new("simple");
        let instances = cloud.bootstrap(group);
        for instance in &instances {
            deployment.insert(instance.clone());
        }
        Self {
            cloud,
            deployment,
            instances,
        }
    }

    /// Keys of every deployed instance, in index order.
    #[must_use]
    pub fn keys(&self) -> Vec<InstanceKey> {
        self.instances.iter().map(Instance::key).collect()
    }

    /// Change-set recreating every instance.
    #[must_use]
    pub fn recreate_all(&self) -> ChangeSet {
        ChangeSet::recreate_all(self.keys())
    }

    /// Orchestrator over the cloud and deployment.
    #[must_use]
    pub fn orchestrator(&self, timings: Timings) -> SimOrchestrator {
        let shared = Arc::new(self.cloud.clone());
        UpdateOrchestrator::new(Arc::clone(&shared), shared, self.deployment.clone(), timings)
    }

    /// Current state of the instance at `index`.
    ///
    /// # Panics
    ///
    /// Panics when no instance was deployed at `index`.
    #[must_use]
    pub fn current(&self, index: usize) -> Instance {
        self.instances
            .get(index)
            .and_then(|instance| self.deployment.get(&instance.key()))
            .unwrap_or_else(|| panic!("no instance deployed at index {index}"))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
