//! In-memory provider and agent fleet.
//!
//! [`SimulatedCloud`] implements the provisioning API and the agent transport
//! against process-local state. It backs the `simulate` subcommand and the
//! test suites, supports fault injection, and keeps an ordered journal of
//! every VM, disk, and agent event so ordering properties can be checked
//! after the fact.

mod agent;
mod provider;
mod scenario;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{NetworkKind, ProviderError};
use crate::model::{Disk, Instance, InstanceGroup, ProcessState, Vm};
use crate::types::{AgentId, DiskCid, VmCid};

pub use agent::AgentBehaviour;
pub use scenario::{Fault, ScenarioOptions, ScenarioOutcome, run_scenario};

/// Something that happened inside the simulated cloud.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SimEvent {
    /// A VM was created.
    VmCreated(VmCid),
    /// A VM was deleted.
    VmDeleted(VmCid),
    /// A disk was attached to a VM.
    DiskAttached {
        /// Disk.
        disk: DiskCid,
        /// VM.
        vm: VmCid,
    },
    /// A disk was detached from a VM.
    DiskDetached {
        /// Disk.
        disk: DiskCid,
        /// VM.
        vm: VmCid,
    },
    /// An agent handled a request.
    AgentRequest {
        /// VM the agent runs on.
        vm: VmCid,
        /// Method handled.
        method: String,
    },
    /// An agent reported its process state.
    StateReported {
        /// VM the agent runs on.
        vm: VmCid,
        /// State reported.
        state: ProcessState,
    },
}

/// A journal entry with its position in the global event order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// What happened.
    pub event: SimEvent,
}

#[derive(Debug)]
struct SimVm {
    agent_id: AgentId,
    ip_addresses: Vec<IpAddr>,
}

#[derive(Debug)]
struct SimAgent {
    vm: VmCid,
    job_state: ProcessState,
    mounted: BTreeSet<DiskCid>,
    applied: Option<serde_json::Value>,
    behaviour: AgentBehaviour,
    polls_while_starting: u32,
}

#[derive(Debug, Default)]
struct Faults {
    create: VecDeque<ProviderError>,
    delete: VecDeque<ProviderError>,
    attach: VecDeque<ProviderError>,
    detach: VecDeque<ProviderError>,
}

#[derive(Debug)]
struct CloudState {
    next_vm: u64,
    next_disk: u64,
    next_host: u32,
    vms: BTreeMap<VmCid, SimVm>,
    agents: HashMap<AgentId, SimAgent>,
    attachments: BTreeMap<DiskCid, BTreeSet<VmCid>>,
    faults: Faults,
    new_vm_behaviour: AgentBehaviour,
    multi_attach: bool,
    disks_per_instance: usize,
    latency: Duration,
    peak_live_vms: usize,
    next_seq: u64,
    journal: Vec<JournalEntry>,
}

impl CloudState {
    fn log(&mut self, event: SimEvent) {
        self.next_seq += 1;
        self.journal.push(JournalEntry {
            seq: self.next_seq,
            event,
        });
    }

    fn next_dynamic_ip(&mut self) -> IpAddr {
        self.next_host += 1;
        let octet = |shift: u32| u8::try_from((self.next_host >> shift) & 0xFF).unwrap_or_default();
        IpAddr::V4(Ipv4Addr::new(10, octet(16), octet(8), octet(0)))
    }

    fn spawn_vm(&mut self, networks: &[NetworkKind], job_state: ProcessState) -> (VmCid, AgentId, Vec<IpAddr>) {
        self.next_vm += 1;
        let cid = VmCid::new(self.next_vm.to_string());
        let agent_id = AgentId::new(format!("agent-{}", uuid::Uuid::new_v4()));
        let ip_addresses = networks
            .iter()
            .map(|kind| match kind {
                NetworkKind::Dynamic => self.next_dynamic_ip(),
                NetworkKind::Static(ip) => *ip,
            })
            .collect::<Vec<_>>();
        self.vms.insert(
            cid.clone(),
            SimVm {
                agent_id: agent_id.clone(),
                ip_addresses: ip_addresses.clone(),
            },
        );
        let behaviour = self.new_vm_behaviour.clone();
        self.agents.insert(
            agent_id.clone(),
            SimAgent {
                vm: cid.clone(),
                job_state,
                mounted: BTreeSet::new(),
                applied: None,
                polls_while_starting: behaviour.polls_until_running,
                behaviour,
            },
        );
        self.peak_live_vms = self.peak_live_vms.max(self.vms.len());
        self.log(SimEvent::VmCreated(cid.clone()));
        (cid, agent_id, ip_addresses)
    }
}

/// Process-local provider and agent fleet. Clones share state.
#[derive(Clone, Debug)]
pub struct SimulatedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// Creates an empty cloud whose disks attach to one VM at a time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState {
                next_vm: 0,
                next_disk: 0,
                next_host: 1,
                vms: BTreeMap::new(),
                agents: HashMap::new(),
                attachments: BTreeMap::new(),
                faults: Faults::default(),
                new_vm_behaviour: AgentBehaviour::default(),
                multi_attach: false,
                disks_per_instance: 1,
                latency: Duration::ZERO,
                peak_live_vms: 0,
                next_seq: 0,
                journal: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allows disks to be attached to two VMs at once.
    #[must_use]
    pub fn with_multi_attach(self, enabled: bool) -> Self {
        self.lock().multi_attach = enabled;
        self
    }

    /// Number of persistent disks `bootstrap` gives each instance of a group
    /// that asks for them.
    #[must_use]
    pub fn with_disks_per_instance(self, count: usize) -> Self {
        self.lock().disks_per_instance = count;
        self
    }

    /// Delays every provider call and agent reply by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    /// Behaviour given to agents on VMs created from now on.
    pub fn set_new_vm_behaviour(&self, behaviour: AgentBehaviour) {
        self.lock().new_vm_behaviour = behaviour;
    }

    /// Replaces the behaviour of an existing agent.
    pub fn set_agent_behaviour(&self, agent_id: &AgentId, behaviour: AgentBehaviour) {
        if let Some(agent) = self.lock().agents.get_mut(agent_id) {
            agent.polls_while_starting = behaviour.polls_until_running;
            agent.behaviour = behaviour;
        }
    }

    /// Fails the next `create_vm` call with `error`. Calls queue up.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.lock().faults.create.push_back(error);
    }

    /// Fails the next `delete_vm` call with `error`. Calls queue up.
    pub fn fail_next_delete(&self, error: ProviderError) {
        self.lock().faults.delete.push_back(error);
    }

    /// Fails the next `attach_disk` call with `error`. Calls queue up.
    pub fn fail_next_attach(&self, error: ProviderError) {
        self.lock().faults.attach.push_back(error);
    }

    /// Fails the next `detach_disk` call with `error`. Calls queue up.
    pub fn fail_next_detach(&self, error: ProviderError) {
        self.lock().faults.detach.push_back(error);
    }

    /// Creates running VMs (and persistent disks, when the group asks for
    /// them) for every instance of `group`, as a first deploy would.
    #[must_use]
    pub fn bootstrap(&self, group: &InstanceGroup) -> Vec<Instance> {
        let networks: Vec<NetworkKind> = group.networks.iter().map(|net| net.kind.clone()).collect();
        let mut state = self.lock();
        (0..group.instances)
            .map(|index| {
                let mut instance = group.new_instance(u32::try_from(index).unwrap_or(u32::MAX));
                let (cid, agent_id, ip_addresses) = state.spawn_vm(&networks, ProcessState::Running);
                if let Some(size_mb) = group.persistent_disk_mb {
                    for _ in 0..state.disks_per_instance {
                        state.next_disk += 1;
                        let disk_cid = DiskCid::new(format!("disk-{}", state.next_disk));
                        state
                            .attachments
                            .entry(disk_cid.clone())
                            .or_default()
                            .insert(cid.clone());
                        if let Some(agent) = state.agents.get_mut(&agent_id) {
                            agent.mounted.insert(disk_cid.clone());
                        }
                        state.log(SimEvent::DiskAttached {
                            disk: disk_cid.clone(),
                            vm: cid.clone(),
                        });
                        instance.disks.push(Disk {
                            cid: disk_cid,
                            size_mb,
                        });
                    }
                }
                instance.active_vm = Some(Vm {
                    cid,
                    agent_id,
                    ip_addresses,
                    process_state: ProcessState::Running,
                });
                instance
            })
            .collect()
    }

    /// Records `disk` as attached to `vm` without going through the
    /// provisioning API, the way a stray operator attachment would look.
    pub fn attach_out_of_band(&self, disk: &DiskCid, vm: &VmCid) {
        let mut state = self.lock();
        state.attachments.entry(disk.clone()).or_default().insert(vm.clone());
        state.log(SimEvent::DiskAttached {
            disk: disk.clone(),
            vm: vm.clone(),
        });
    }

    /// Whether `disk` is attached to `vm`.
    #[must_use]
    pub fn disk_attached_to_vm(&self, vm: &VmCid, disk: &DiskCid) -> bool {
        self.lock()
            .attachments
            .get(disk)
            .is_some_and(|holders| holders.contains(vm))
    }

    /// VMs `disk` is attached to.
    #[must_use]
    pub fn disk_holders(&self, disk: &DiskCid) -> Vec<VmCid> {
        self.lock()
            .attachments
            .get(disk)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `disk` is mounted by the agent on `vm`.
    #[must_use]
    pub fn disk_mounted_on(&self, vm: &VmCid, disk: &DiskCid) -> bool {
        self.lock()
            .agents
            .values()
            .any(|agent| &agent.vm == vm && agent.mounted.contains(disk))
    }

    /// Whether `vm` exists.
    #[must_use]
    pub fn vm_exists(&self, vm: &VmCid) -> bool {
        self.lock().vms.contains_key(vm)
    }

    /// Identifiers of every existing VM.
    #[must_use]
    pub fn live_vms(&self) -> Vec<VmCid> {
        self.lock().vms.keys().cloned().collect()
    }

    /// Largest number of VMs that existed at the same time.
    #[must_use]
    pub fn peak_live_vms(&self) -> usize {
        self.lock().peak_live_vms
    }

    /// Process state of the agent on `vm`.
    #[must_use]
    pub fn process_state(&self, vm: &VmCid) -> Option<ProcessState> {
        self.lock()
            .agents
            .values()
            .find(|agent| &agent.vm == vm)
            .map(|agent| agent.job_state)
    }

    /// Spec last applied by the agent on `vm`.
    #[must_use]
    pub fn applied_spec(&self, vm: &VmCid) -> Option<serde_json::Value> {
        self.lock()
            .agents
            .values()
            .find(|agent| &agent.vm == vm)
            .and_then(|agent| agent.applied.clone())
    }

    /// Snapshot of the event journal.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Sequence number of the first event matching `predicate`.
    pub fn first_seq(&self, predicate: impl Fn(&SimEvent) -> bool) -> Option<u64> {
        self.lock()
            .journal
            .iter()
            .find(|entry| predicate(&entry.event))
            .map(|entry| entry.seq)
    }
}

#[cfg(test)]
mod tests;
