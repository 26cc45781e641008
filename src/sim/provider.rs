//! Provisioning API of the simulated cloud.

use tokio::time::sleep;

use crate::backend::{
    BackendFuture, CreatedVm, DiskProvisioner, NetworkKind, ProviderError, Provisioner, VmSpec,
};
use crate::model::ProcessState;
use crate::types::{DiskCid, VmCid};

use super::{SimEvent, SimulatedCloud};

impl SimulatedCloud {
    async fn pause(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }
    }
}

impl Provisioner for SimulatedCloud {
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BackendFuture<'a, CreatedVm, ProviderError> {
        Box::pin(async move {
            spec.validate()?;
            self.pause().await;
            let mut state = self.lock();
            if let Some(err) = state.faults.create.pop_front() {
                return Err(err);
            }
            let kinds: Vec<NetworkKind> = spec.networks.iter().map(|net| net.kind.clone()).collect();
            for kind in &kinds {
                if let NetworkKind::Static(ip) = kind
                    && let Some((holder, _)) = state
                        .vms
                        .iter()
                        .find(|(_, vm)| vm.ip_addresses.contains(ip))
                {
                    return Err(ProviderError::AddressInUse {
                        ip: *ip,
                        holder: holder.clone(),
                    });
                }
            }
            let (cid, agent_id, ip_addresses) = state.spawn_vm(&kinds, ProcessState::Starting);
            Ok(CreatedVm {
                cid,
                agent_id,
                ip_addresses,
            })
        })
    }

    fn delete_vm<'a>(&'a self, cid: &'a VmCid) -> BackendFuture<'a, (), ProviderError> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.lock();
            if let Some(err) = state.faults.delete.pop_front() {
                return Err(err);
            }
            let Some(vm) = state.vms.remove(cid) else {
                return Err(ProviderError::VmNotFound { cid: cid.clone() });
            };
            state.agents.remove(&vm.agent_id);
            let detached: Vec<DiskCid> = state
                .attachments
                .iter_mut()
                .filter_map(|(disk, holders)| holders.remove(cid).then(|| disk.clone()))
                .collect();
            for disk in detached {
                state.log(SimEvent::DiskDetached {
                    disk,
                    vm: cid.clone(),
                });
            }
            state.log(SimEvent::VmDeleted(cid.clone()));
            Ok(())
        })
    }
}

impl DiskProvisioner for SimulatedCloud {
    fn attach_disk<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, (), ProviderError> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.lock();
            if let Some(err) = state.faults.attach.pop_front() {
                return Err(err);
            }
            if !state.vms.contains_key(vm) {
                return Err(ProviderError::VmNotFound { cid: vm.clone() });
            }
            let multi_attach = state.multi_attach;
            let holders = state.attachments.entry(disk.clone()).or_default();
            if holders.contains(vm) {
                return Ok(());
            }
            if !multi_attach && let Some(other) = holders.iter().next() {
                return Err(ProviderError::DiskBusy {
                    disk_cid: disk.clone(),
                    vm_cid: other.clone(),
                });
            }
            holders.insert(vm.clone());
            state.log(SimEvent::DiskAttached {
                disk: disk.clone(),
                vm: vm.clone(),
            });
            Ok(())
        })
    }

    fn detach_disk<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, (), ProviderError> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.lock();
            if let Some(err) = state.faults.detach.pop_front() {
                return Err(err);
            }
            let Some(holders) = state.attachments.get_mut(disk) else {
                return Err(ProviderError::DiskNotFound { cid: disk.clone() });
            };
            if holders.remove(vm) {
                let owner = state.agents.values_mut().find(|agent| &agent.vm == vm);
                if let Some(agent) = owner {
                    agent.mounted.remove(disk);
                }
                state.log(SimEvent::DiskDetached {
                    disk: disk.clone(),
                    vm: vm.clone(),
                });
            }
            Ok(())
        })
    }

    fn is_disk_attached<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, bool, ProviderError> {
        Box::pin(async move { Ok(self.disk_attached_to_vm(vm, disk)) })
    }

    fn disk_attachments<'a>(&'a self, disk: &'a DiskCid) -> BackendFuture<'a, Vec<VmCid>, ProviderError> {
        Box::pin(async move {
            self.lock()
                .attachments
                .get(disk)
                .map(|holders| holders.iter().cloned().collect())
                .ok_or_else(|| ProviderError::DiskNotFound { cid: disk.clone() })
        })
    }

    fn supports_multi_attach(&self) -> bool {
        self.lock().multi_attach
    }
}
