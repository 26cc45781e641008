//! Domain model for instance groups, instances, VMs, and disks.
//!
//! An [`Instance`] owns its disks and at most one active VM. While a hot-swap
//! is in progress the instance additionally holds the replacement VM in its
//! `incoming_vm` slot; the slot is promoted once the swap completes.

use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{NetworkRequest, ProviderError, VmSpec};
use crate::types::{AgentId, DiskCid, VmCid};

/// Process state reported by the agent on a VM.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Jobs are being started.
    Starting,
    /// All jobs report healthy.
    Running,
    /// At least one job failed.
    Failing,
    /// The agent did not answer.
    Unresponsive,
    /// Jobs were stopped on request.
    Stopped,
}

impl ProcessState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failing => "failing",
            Self::Unresponsive => "unresponsive",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Algorithm used to replace an instance's VM.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UpdateStrategy {
    /// Delete the old VM, then create the new one.
    #[default]
    InPlace,
    /// Create the new VM first and decommission the old one once healthy.
    HotSwap,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::InPlace => "in-place",
            Self::HotSwap => "hot-swap",
        })
    }
}

/// Raised when a strategy name is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown update strategy '{0}' (expected 'in-place' or 'hot-swap')")]
pub struct UnknownStrategy(pub String);

impl FromStr for UpdateStrategy {
    type Err = UnknownStrategy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "in-place" | "legacy" => Ok(Self::InPlace),
            "hot-swap" | "create-swap-delete" => Ok(Self::HotSwap),
            other => Err(UnknownStrategy(other.to_owned())),
        }
    }
}

/// Immutable per-deploy update configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UpdateConfig {
    /// Update algorithm.
    pub strategy: UpdateStrategy,
    /// Upper bound on concurrently updating instances.
    pub max_in_flight: NonZeroUsize,
    /// Number of instances updated first to validate the rollout.
    pub canaries: usize,
    /// Health-check grace period for canaries.
    pub canary_watch_time: Duration,
    /// Health-check grace period for the remaining instances.
    pub update_watch_time: Duration,
}

impl UpdateConfig {
    /// Hot-swap configuration with the given concurrency bound and no canaries.
    #[must_use]
    pub const fn hot_swap(max_in_flight: NonZeroUsize) -> Self {
        Self {
            strategy: UpdateStrategy::HotSwap,
            max_in_flight,
            canaries: 0,
            canary_watch_time: Duration::from_secs(30),
            update_watch_time: Duration::from_secs(30),
        }
    }

    /// Sets the canary count.
    #[must_use]
    pub const fn with_canaries(mut self, canaries: usize) -> Self {
        self.canaries = canaries;
        self
    }

    /// Sets both watch times.
    #[must_use]
    pub const fn with_watch_times(mut self, canary: Duration, update: Duration) -> Self {
        self.canary_watch_time = canary;
        self.update_watch_time = update;
        self
    }

    /// Watch time that applies to an instance.
    #[must_use]
    pub const fn watch_time(&self, canary: bool) -> Duration {
        if canary {
            self.canary_watch_time
        } else {
            self.update_watch_time
        }
    }
}

/// Stable identity of an instance: group name plus per-instance UUID.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceKey {
    /// Instance group name.
    pub group: String,
    /// Stable identifier that survives VM replacement.
    pub id: Uuid,
}

impl InstanceKey {
    /// Creates a key.
    #[must_use]
    pub fn new(group: impl Into<String>, id: Uuid) -> Self {
        Self {
            group: group.into(),
            id,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.group, self.id)
    }
}

/// A provisioned VM serving an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vm {
    /// Provider assigned identifier.
    pub cid: VmCid,
    /// Agent address on the VM.
    pub agent_id: AgentId,
    /// Addresses reserved for the VM.
    pub ip_addresses: Vec<IpAddr>,
    /// Last process state observed through the agent.
    pub process_state: ProcessState,
}

/// A persistent disk owned by an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Disk {
    /// Provider assigned identifier.
    pub cid: DiskCid,
    /// Size in megabytes.
    pub size_mb: u64,
}

/// Declarative description of an instance group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceGroup {
    /// Group name.
    pub name: String,
    /// Number of instances the group should run.
    pub instances: usize,
    /// VM type for every instance.
    pub vm_type: String,
    /// Stemcell for every instance.
    pub stemcell: String,
    /// Availability zone (empty when zones are not used).
    pub availability_zone: String,
    /// Networks every instance joins.
    pub networks: Vec<NetworkRequest>,
    /// Persistent disk size in megabytes, if any.
    pub persistent_disk_mb: Option<u64>,
    /// Update configuration.
    pub update: UpdateConfig,
}

impl InstanceGroup {
    /// Builds the instance slot at `index` with a fresh identity and no VM.
    #[must_use]
    pub fn new_instance(&self, index: u32) -> Instance {
        Instance {
            group: self.name.clone(),
            index,
            id: Uuid::new_v4(),
            availability_zone: self.availability_zone.clone(),
            vm_type: self.vm_type.clone(),
            stemcell: self.stemcell.clone(),
            networks: self.networks.clone(),
            active_vm: None,
            incoming_vm: None,
            disks: Vec::new(),
        }
    }
}

/// An instance slot: identity, VMs, and disks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Instance group name.
    pub group: String,
    /// Index within the group.
    pub index: u32,
    /// Stable identifier.
    pub id: Uuid,
    /// Availability zone.
    pub availability_zone: String,
    /// VM type.
    pub vm_type: String,
    /// Stemcell.
    pub stemcell: String,
    /// Networks the instance joins.
    pub networks: Vec<NetworkRequest>,
    /// VM currently serving the instance.
    pub active_vm: Option<Vm>,
    /// Replacement VM held while a hot-swap is in progress.
    pub incoming_vm: Option<Vm>,
    /// Persistent disks owned by the instance.
    pub disks: Vec<Disk>,
}

impl Instance {
    /// Returns the stable key.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.group.clone(), self.id)
    }

    /// Returns the `<group>/<id>` display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.key().to_string()
    }

    /// Builds the spec used to create a VM for this instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is empty.
    pub fn vm_spec(&self) -> Result<VmSpec, ProviderError> {
        self.networks
            .iter()
            .cloned()
            .fold(
                VmSpec::builder()
                    .instance_name(self.name())
                    .availability_zone(&self.availability_zone)
                    .vm_type(&self.vm_type)
                    .stemcell(&self.stemcell),
                crate::backend::VmSpecBuilder::network,
            )
            .build()
    }

    /// Renders the configuration the agent applies on a VM.
    #[must_use]
    pub fn apply_spec(&self, vm: &Vm) -> Value {
        json!({
            "name": self.group,
            "index": self.index,
            "id": self.id.to_string(),
            "az": self.availability_zone,
            "vm_type": self.vm_type,
            "stemcell": self.stemcell,
            "networks": self
                .networks
                .iter()
                .zip(vm.ip_addresses.iter())
                .map(|(net, ip)| json!({ "name": net.name, "ip": ip.to_string() }))
                .collect::<Vec<_>>(),
            "persistent_disks": self
                .disks
                .iter()
                .map(|disk| json!({ "cid": disk.cid, "size": disk.size_mb }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Classification of one instance produced by manifest diffing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    /// Instance being classified.
    pub key: InstanceKey,
    /// Whether the instance's VM must be recreated.
    pub recreate: bool,
}

/// Result of diffing the desired manifest against the deployed state. Each
/// instance appears at most once.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Creates an empty change-set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every listed instance for recreation, as `deploy --recreate` does.
    #[must_use]
    pub fn recreate_all(keys: impl IntoIterator<Item = InstanceKey>) -> Self {
        let mut changes = Self::new();
        for key in keys {
            changes.push(key, true);
        }
        changes
    }

    /// Classifies `key`. A key classified again keeps its position and takes
    /// the newer classification.
    pub fn push(&mut self, key: InstanceKey, recreate: bool) {
        match self.changes.iter_mut().find(|change| change.key == key) {
            Some(existing) => existing.recreate = recreate,
            None => self.changes.push(Change { key, recreate }),
        }
    }

    /// Instances whose VM must be recreated, in change-set order.
    pub fn requiring_recreate(&self) -> impl Iterator<Item = &InstanceKey> {
        self.changes
            .iter()
            .filter(|change| change.recreate)
            .map(|change| &change.key)
    }

    /// Number of classified instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the change-set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;

    fn instance() -> Instance {
        InstanceGroup {
            name: String::from("foobar"),
            instances: 1,
            vm_type: String::from("a"),
            stemcell: String::from("ubuntu-noble"),
            availability_zone: String::new(),
            networks: vec![NetworkRequest::dynamic("a")],
            persistent_disk_mb: None,
            update: UpdateConfig::hot_swap(NonZeroUsize::MIN),
        }
        .new_instance(0)
    }

    #[rstest]
    #[case("hot-swap", UpdateStrategy::HotSwap)]
    #[case("create-swap-delete", UpdateStrategy::HotSwap)]
    #[case(" in-place ", UpdateStrategy::InPlace)]
    #[case("legacy", UpdateStrategy::InPlace)]
    fn strategy_parses_known_names(#[case] raw: &str, #[case] expected: UpdateStrategy) {
        assert_eq!(raw.parse::<UpdateStrategy>(), Ok(expected));
    }

    #[test]
    fn strategy_rejects_unknown_names() {
        let err = "blue-green"
            .parse::<UpdateStrategy>()
            .expect_err("unknown strategy should fail");
        assert!(err.to_string().contains("blue-green"), "message: {err}");
    }

    #[test]
    fn vm_spec_carries_instance_identity() {
        let instance = instance();
        let spec = instance.vm_spec().expect("spec should build");
        assert_eq!(spec.instance_name, format!("foobar/{}", instance.id));
        assert_eq!(spec.vm_type, "a");
        assert_eq!(spec.networks.len(), 1);
    }

    #[test]
    fn apply_spec_pairs_networks_with_vm_addresses() {
        let mut instance = instance();
        instance.disks.push(Disk {
            cid: DiskCid::from("disk-1"),
            size_mb: 1000,
        });
        let vm = Vm {
            cid: VmCid::from("vm-1"),
            agent_id: AgentId::from("agent-1"),
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
            process_state: ProcessState::Starting,
        };

        let spec = instance.apply_spec(&vm);

        assert_eq!(spec["networks"][0]["ip"], "10.0.0.2");
        assert_eq!(spec["persistent_disks"][0]["cid"], "disk-1");
        assert_eq!(spec["persistent_disks"][0]["size"], 1000);
    }

    #[test]
    fn change_set_filters_instances_needing_recreation() {
        let mut changes = ChangeSet::new();
        let recreate = InstanceKey::new("foobar", Uuid::new_v4());
        changes.push(recreate.clone(), true);
        changes.push(InstanceKey::new("foobar", Uuid::new_v4()), false);

        let selected: Vec<_> = changes.requiring_recreate().cloned().collect();
        assert_eq!(selected, vec![recreate]);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn change_set_holds_each_instance_once() {
        let first = InstanceKey::new("foobar", Uuid::new_v4());
        let second = InstanceKey::new("foobar", Uuid::new_v4());
        let mut changes = ChangeSet::recreate_all([first.clone(), second.clone(), first.clone()]);
        changes.push(second.clone(), false);
        changes.push(second.clone(), true);

        let selected: Vec<_> = changes.requiring_recreate().cloned().collect();
        assert_eq!(selected, vec![first, second]);
        assert_eq!(changes.len(), 2);
    }
}
