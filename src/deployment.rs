//! Shared deployment state and the instance listing surface.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::model::{Instance, InstanceKey, ProcessState, Vm};

/// One row of the VM listing. An instance mid hot-swap contributes two rows.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VmListing {
    /// Availability zone of the instance.
    pub availability_zone: String,
    /// `<group>/<id>` of the instance the VM serves.
    pub instance_name: String,
    /// Addresses reserved for the VM.
    pub ip_addresses: Vec<String>,
    /// Last observed process state.
    pub process_state: ProcessState,
    /// Provider identifier of the VM.
    pub vm_cid: String,
    /// VM type of the instance.
    pub vm_type: String,
}

impl VmListing {
    fn new(instance: &Instance, vm: &Vm) -> Self {
        Self {
            availability_zone: instance.availability_zone.clone(),
            instance_name: instance.name(),
            ip_addresses: vm.ip_addresses.iter().map(ToString::to_string).collect(),
            process_state: vm.process_state,
            vm_cid: vm.cid.to_string(),
            vm_type: instance.vm_type.clone(),
        }
    }
}

/// Lock-protected store of every instance in a deployment.
///
/// Clones share the same underlying state so the orchestrator, per-instance
/// tasks, and status queries observe one view.
#[derive(Clone, Debug, Default)]
pub struct Deployment {
    name: String,
    instances: Arc<Mutex<BTreeMap<InstanceKey, Instance>>>,
}

impl Deployment {
    /// Creates an empty deployment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instances: Arc::default(),
        }
    }

    /// Deployment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<InstanceKey, Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces an instance.
    pub fn insert(&self, instance: Instance) {
        self.lock().insert(instance.key(), instance);
    }

    /// Returns a snapshot of one instance.
    #[must_use]
    pub fn get(&self, key: &InstanceKey) -> Option<Instance> {
        self.lock().get(key).cloned()
    }

    /// Applies `mutate` to an instance in place, returning its result.
    pub fn update<R>(&self, key: &InstanceKey, mutate: impl FnOnce(&mut Instance) -> R) -> Option<R> {
        self.lock().get_mut(key).map(mutate)
    }

    /// Snapshots every instance, ordered by group then index.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.lock().values().cloned().collect();
        all.sort_by(|left, right| {
            left.group
                .cmp(&right.group)
                .then(left.index.cmp(&right.index))
        });
        all
    }

    /// Lists every VM, active ones first within each instance.
    #[must_use]
    pub fn list_vms(&self) -> Vec<VmListing> {
        self.instances()
            .iter()
            .flat_map(|instance| {
                [instance.active_vm.as_ref(), instance.incoming_vm.as_ref()]
                    .into_iter()
                    .flatten()
                    .map(|vm| VmListing::new(instance, vm))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
