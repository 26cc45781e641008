//! Unit tests for the simulated cloud.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::agent::{AgentCommand, AgentError, AgentMessenger};
use crate::backend::{DiskProvisioner, NetworkRequest, ProviderOperation, Provisioner, VmSpec};
use crate::test_support::{fast_timings, instance_group};

#[fixture]
fn cloud() -> SimulatedCloud {
    SimulatedCloud::new()
}

fn spec(networks: Vec<NetworkRequest>) -> VmSpec {
    networks
        .into_iter()
        .fold(
            VmSpec::builder()
                .instance_name("foobar/0")
                .vm_type("a")
                .stemcell("ubuntu-noble"),
            crate::backend::VmSpecBuilder::network,
        )
        .build()
        .expect("spec should build")
}

fn messenger(cloud: &SimulatedCloud) -> AgentMessenger<SimulatedCloud> {
    AgentMessenger::new(Arc::new(cloud.clone())).with_timeouts(fast_timings().agent)
}

#[rstest]
fn bootstrap_attaches_and_mounts_disks(cloud: SimulatedCloud) {
    let instances = cloud.bootstrap(&instance_group("foobar", 2, Some(1000)));

    assert_eq!(instances.len(), 2);
    for instance in &instances {
        let vm = instance.active_vm.as_ref().expect("bootstrap creates a vm");
        let disk = instance.disks.first().expect("bootstrap creates a disk");
        assert!(cloud.disk_attached_to_vm(&vm.cid, &disk.cid));
        assert!(cloud.disk_mounted_on(&vm.cid, &disk.cid));
        assert_eq!(cloud.process_state(&vm.cid), Some(ProcessState::Running));
        assert_eq!(disk.size_mb, 1000);
    }
}

#[rstest]
fn bootstrap_can_give_each_instance_several_disks() {
    let cloud = SimulatedCloud::new().with_disks_per_instance(3);
    let instances = cloud.bootstrap(&instance_group("foobar", 2, Some(10)));

    let mut seen = Vec::new();
    for instance in &instances {
        let vm = instance.active_vm.as_ref().expect("bootstrap creates a vm");
        assert_eq!(instance.disks.len(), 3);
        for disk in &instance.disks {
            assert_eq!(cloud.disk_holders(&disk.cid), vec![vm.cid.clone()]);
            assert!(cloud.disk_mounted_on(&vm.cid, &disk.cid));
            seen.push(disk.cid.clone());
        }
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 6);
}

#[rstest]
#[tokio::test]
async fn attachments_list_every_holder(cloud: SimulatedCloud) {
    let instances = cloud.bootstrap(&instance_group("foobar", 1, Some(10)));
    let instance = instances.first().expect("one instance");
    let disk = &instance.disks.first().expect("one disk").cid;
    let old = &instance.active_vm.as_ref().expect("vm").cid;
    let stray = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds")
        .cid;

    cloud.attach_out_of_band(disk, &stray);

    let holders = cloud.disk_attachments(disk).await.expect("disk is known");
    assert_eq!(holders, vec![old.clone(), stray]);
    assert!(matches!(
        cloud.disk_attachments(&DiskCid::from("disk-missing")).await,
        Err(ProviderError::DiskNotFound { .. })
    ));
}

#[rstest]
fn dynamic_addresses_are_unique(cloud: SimulatedCloud) {
    let instances = cloud.bootstrap(&instance_group("foobar", 3, None));
    let mut addresses: Vec<IpAddr> = instances
        .iter()
        .flat_map(|instance| instance.active_vm.iter().flat_map(|vm| vm.ip_addresses.clone()))
        .collect();
    addresses.sort();
    addresses.dedup();

    assert_eq!(addresses.len(), 3);
    assert!(addresses.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
}

#[rstest]
#[tokio::test]
async fn static_address_held_by_live_vm_is_refused(cloud: SimulatedCloud) {
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5));
    let fixed = spec(vec![NetworkRequest::fixed("a", ip)]);
    let first = cloud.create_vm(&fixed).await.expect("first vm gets the address");

    let err = cloud.create_vm(&fixed).await.expect_err("address is taken");

    assert_eq!(
        err,
        ProviderError::AddressInUse {
            ip,
            holder: first.cid.clone()
        }
    );
    cloud.delete_vm(&first.cid).await.expect("delete succeeds");
    cloud.create_vm(&fixed).await.expect("address is free after delete");
}

#[rstest]
#[tokio::test]
async fn queued_faults_fail_calls_in_order(cloud: SimulatedCloud) {
    cloud.fail_next_create(ProviderError::Transient {
        operation: ProviderOperation::CreateVm,
        message: String::from("busy"),
    });
    let request = spec(vec![NetworkRequest::dynamic("a")]);

    let err = cloud.create_vm(&request).await.expect_err("fault fires first");
    assert!(err.is_transient());
    cloud.create_vm(&request).await.expect("second call succeeds");
    assert_eq!(cloud.live_vms().len(), 1);
}

#[rstest]
#[tokio::test]
async fn deleting_unknown_vm_reports_not_found(cloud: SimulatedCloud) {
    let err = cloud
        .delete_vm(&VmCid::from("404"))
        .await
        .expect_err("unknown vm");
    assert!(matches!(err, ProviderError::VmNotFound { .. }));
}

#[rstest]
#[tokio::test]
async fn single_attach_disks_refuse_a_second_holder(cloud: SimulatedCloud) {
    let instances = cloud.bootstrap(&instance_group("foobar", 1, Some(10)));
    let instance = instances.first().expect("one instance");
    let disk = &instance.disks.first().expect("one disk").cid;
    let old = &instance.active_vm.as_ref().expect("vm").cid;
    let new = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds")
        .cid;

    let err = cloud.attach_disk(&new, disk).await.expect_err("disk is busy");
    assert_eq!(
        err,
        ProviderError::DiskBusy {
            disk_cid: disk.clone(),
            vm_cid: old.clone()
        }
    );

    cloud.detach_disk(old, disk).await.expect("detach succeeds");
    assert!(!cloud.disk_mounted_on(old, disk), "detach drops the mount");
    cloud.attach_disk(&new, disk).await.expect("attach succeeds");
    cloud.attach_disk(&new, disk).await.expect("attach is idempotent");
    assert_eq!(cloud.disk_holders(disk), vec![new]);
}

#[rstest]
#[tokio::test]
async fn multi_attach_allows_two_holders() {
    let cloud = SimulatedCloud::new().with_multi_attach(true);
    let instances = cloud.bootstrap(&instance_group("foobar", 1, Some(10)));
    let instance = instances.first().expect("one instance");
    let disk = &instance.disks.first().expect("one disk").cid;
    let new = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds")
        .cid;

    cloud.attach_disk(&new, disk).await.expect("second attach allowed");

    assert_eq!(cloud.disk_holders(disk).len(), 2);
    assert!(cloud.supports_multi_attach());
}

#[rstest]
#[tokio::test]
async fn deleting_a_vm_detaches_its_disks(cloud: SimulatedCloud) {
    let instances = cloud.bootstrap(&instance_group("foobar", 1, Some(10)));
    let instance = instances.first().expect("one instance");
    let disk = instance.disks.first().expect("one disk").cid.clone();
    let vm = instance.active_vm.clone().expect("vm");

    cloud.delete_vm(&vm.cid).await.expect("delete succeeds");

    assert!(cloud.disk_holders(&disk).is_empty());
    assert!(!cloud.vm_exists(&vm.cid));
    let deleted = cloud
        .first_seq(|event| *event == SimEvent::VmDeleted(vm.cid.clone()))
        .expect("deletion journaled");
    let detached = cloud
        .first_seq(|event| matches!(event, SimEvent::DiskDetached { disk: d, .. } if *d == disk))
        .expect("detach journaled");
    assert!(detached < deleted);
}

#[rstest]
#[tokio::test]
async fn mount_requires_provider_attachment(cloud: SimulatedCloud) {
    let created = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds");
    let messenger = messenger(&cloud);

    let err = messenger
        .send_with_retry(&created.agent_id, &AgentCommand::MountDisk(DiskCid::from("disk-9")))
        .await
        .expect_err("disk is not attached");

    assert!(matches!(err, AgentError::Rejected { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn agent_reports_running_after_configured_polls(cloud: SimulatedCloud) {
    cloud.set_new_vm_behaviour(AgentBehaviour::default().running_after_polls(2));
    let created = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds");
    let messenger = messenger(&cloud);

    messenger
        .send_with_retry(&created.agent_id, &AgentCommand::Start)
        .await
        .expect("start acknowledged");
    let mut states = Vec::new();
    for _ in 0..3 {
        states.push(messenger.get_state(&created.agent_id).await.expect("state"));
    }

    assert_eq!(
        states,
        vec![ProcessState::Starting, ProcessState::Starting, ProcessState::Running]
    );
}

#[rstest]
#[tokio::test]
async fn apply_stores_the_delivered_spec(cloud: SimulatedCloud) {
    let created = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds");
    let messenger = messenger(&cloud);

    messenger
        .send_with_retry(&created.agent_id, &AgentCommand::Apply(json!({ "name": "foobar" })))
        .await
        .expect("apply acknowledged");

    assert_eq!(cloud.applied_spec(&created.cid), Some(json!({ "name": "foobar" })));
}

#[rstest]
#[tokio::test]
async fn agents_of_deleted_vms_are_unreachable(cloud: SimulatedCloud) {
    let created = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds");
    cloud.delete_vm(&created.cid).await.expect("delete succeeds");

    let err = messenger(&cloud)
        .get_state(&created.agent_id)
        .await
        .expect_err("agent is gone");

    assert!(err.is_retryable(), "transport errors are retryable: {err:?}");
}

#[rstest]
#[tokio::test]
async fn silent_methods_time_out(cloud: SimulatedCloud) {
    cloud.set_new_vm_behaviour(AgentBehaviour::default().silence("get_state"));
    let created = cloud
        .create_vm(&spec(vec![NetworkRequest::dynamic("a")]))
        .await
        .expect("create succeeds");

    let err = messenger(&cloud)
        .get_state(&created.agent_id)
        .await
        .expect_err("no reply");

    assert!(matches!(err, AgentError::Timeout { .. }), "got {err:?}");
}

#[rstest]
fn peak_live_vms_tracks_the_high_water_mark(cloud: SimulatedCloud) {
    let _instances = cloud.bootstrap(&instance_group("foobar", 3, None));
    assert_eq!(cloud.peak_live_vms(), 3);
    assert_eq!(cloud.live_vms().len(), 3);
}
