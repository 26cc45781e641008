//! Unit tests for disk migration.

use std::sync::Arc;

use rstest::rstest;

use super::*;
use crate::backend::Provisioner;
use crate::model::{Instance, ProcessState};
use crate::sim::{AgentBehaviour, SimEvent, SimulatedCloud};
use crate::test_support::{fast_timings, instance_group};

struct Fixture {
    cloud: SimulatedCloud,
    migrator: DiskMigrator<SimulatedCloud, SimulatedCloud>,
    instance: Instance,
    old: Vm,
    new: Vm,
}

impl Fixture {
    fn disk(&self) -> &DiskCid {
        &self.instance.disks.first().expect("instance has a disk").cid
    }
}

async fn fixture(cloud: SimulatedCloud, mode: DiskAttachMode) -> Fixture {
    let instance = cloud
        .bootstrap(&instance_group("foobar", 1, Some(1000)))
        .into_iter()
        .next()
        .expect("one instance");
    let old = instance.active_vm.clone().expect("bootstrapped vm");
    let created = cloud
        .create_vm(&instance.vm_spec().expect("spec builds"))
        .await
        .expect("create succeeds");
    let new = Vm {
        cid: created.cid,
        agent_id: created.agent_id,
        ip_addresses: created.ip_addresses,
        process_state: ProcessState::Starting,
    };
    let shared = Arc::new(cloud.clone());
    let messenger = AgentMessenger::new(Arc::clone(&shared)).with_timeouts(fast_timings().agent);
    Fixture {
        migrator: DiskMigrator::new(shared, messenger).with_mode(mode),
        cloud,
        instance,
        old,
        new,
    }
}

fn seq(cloud: &SimulatedCloud, wanted: &SimEvent) -> u64 {
    cloud
        .first_seq(|event| event == wanted)
        .unwrap_or_else(|| panic!("event {wanted:?} not journaled"))
}

#[rstest]
#[tokio::test]
async fn serialized_move_detaches_before_attaching() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Provider).await;
    let disk = fx.disk().clone();
    fx.migrator.messenger.log().start_recording();

    let report = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect("migration succeeds");

    assert_eq!(report.moved, vec![disk.clone()]);
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.new.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.new.cid, &disk));
    let detached = seq(
        &fx.cloud,
        &SimEvent::DiskDetached {
            disk: disk.clone(),
            vm: fx.old.cid.clone(),
        },
    );
    let attached = seq(
        &fx.cloud,
        &SimEvent::DiskAttached {
            disk,
            vm: fx.new.cid.clone(),
        },
    );
    assert!(detached < attached);
    let messages = fx.migrator.messenger.log().finish_recording();
    assert_eq!(messages.methods_for(&fx.old.agent_id), vec![String::from("unmount_disk")]);
    assert_eq!(messages.methods_for(&fx.new.agent_id), vec![String::from("mount_disk")]);
}

#[rstest]
#[tokio::test]
async fn concurrent_move_attaches_before_detaching() {
    let fx = fixture(SimulatedCloud::new().with_multi_attach(true), DiskAttachMode::Provider).await;
    let disk = fx.disk().clone();
    assert!(fx.migrator.attaches_concurrently());

    fx.migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect("migration succeeds");

    let attached = seq(
        &fx.cloud,
        &SimEvent::DiskAttached {
            disk: disk.clone(),
            vm: fx.new.cid.clone(),
        },
    );
    let detached = seq(
        &fx.cloud,
        &SimEvent::DiskDetached {
            disk: disk.clone(),
            vm: fx.old.cid.clone(),
        },
    );
    assert!(attached < detached);
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.new.cid.clone()]);
}

#[rstest]
#[case(DiskAttachMode::Serialized, true, false)]
#[case(DiskAttachMode::Concurrent, false, false)]
#[case(DiskAttachMode::Concurrent, true, true)]
#[case(DiskAttachMode::Provider, false, false)]
#[case(DiskAttachMode::Provider, true, true)]
#[tokio::test]
async fn attach_strategy_follows_mode_and_provider(
    #[case] mode: DiskAttachMode,
    #[case] multi_attach: bool,
    #[case] expected: bool,
) {
    let fx = fixture(SimulatedCloud::new().with_multi_attach(multi_attach), mode).await;
    assert_eq!(fx.migrator.attaches_concurrently(), expected);
}

#[rstest]
#[tokio::test]
async fn rejected_mount_returns_disk_to_previous_vm() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Serialized).await;
    fx.cloud.set_agent_behaviour(
        &fx.new.agent_id,
        AgentBehaviour::default().reject("mount_disk", "device busy"),
    );
    let disk = fx.disk().clone();

    let failure = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect_err("mount is rejected");

    assert!(matches!(failure.error, DiskError::Mount { .. }), "got {failure:?}");
    assert!(failure.error.agent_error().is_some());
    assert!(failure.unreconciled.is_empty());
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.old.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.old.cid, &disk));
}

#[rstest]
#[tokio::test]
async fn failed_unwind_is_reported_per_disk() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Serialized).await;
    fx.cloud.set_agent_behaviour(
        &fx.new.agent_id,
        AgentBehaviour::default().reject("mount_disk", "device busy"),
    );
    fx.cloud.set_agent_behaviour(
        &fx.old.agent_id,
        AgentBehaviour::default().reject("mount_disk", "filesystem corrupt"),
    );

    let failure = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect_err("mount is rejected");

    let [entry] = failure.unreconciled.as_slice() else {
        panic!("expected one unreconciled disk, got {:?}", failure.unreconciled);
    };
    assert_eq!(&entry.disk, fx.disk());
    assert_eq!(entry.attached_to, vec![fx.old.cid.clone()]);
    assert!(entry.reason.contains("filesystem corrupt"), "reason: {}", entry.reason);
}

#[rstest]
#[tokio::test]
async fn refused_unmount_leaves_disk_untouched() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Serialized).await;
    fx.cloud.set_agent_behaviour(
        &fx.old.agent_id,
        AgentBehaviour::default().reject("unmount_disk", "device is busy"),
    );
    let disk = fx.disk().clone();

    let failure = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect_err("unmount is refused");

    assert!(matches!(failure.error, DiskError::Unmount { .. }), "got {failure:?}");
    assert!(failure.unreconciled.is_empty());
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.old.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.old.cid, &disk));
}

#[rstest]
#[tokio::test]
async fn unresponsive_source_agent_does_not_block_the_move() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Serialized).await;
    fx.cloud.set_agent_behaviour(
        &fx.old.agent_id,
        AgentBehaviour::default().silence("unmount_disk"),
    );
    let disk = fx.disk().clone();

    fx.migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect("migration proceeds without the unmount");

    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.new.cid.clone()]);
}

#[rstest]
#[tokio::test]
async fn provider_attach_failure_reattaches_to_previous_vm() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Serialized).await;
    fx.cloud.fail_next_attach(ProviderError::Fatal {
        operation: crate::backend::ProviderOperation::AttachDisk,
        message: String::from("no free slot"),
    });
    let disk = fx.disk().clone();

    let failure = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect_err("attach fails");

    assert!(failure.error.provider_error().is_some());
    assert!(failure.unreconciled.is_empty());
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.old.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.old.cid, &disk));
}

#[rstest]
#[tokio::test]
async fn later_disk_failure_moves_earlier_disks_back() {
    let fx = fixture(SimulatedCloud::new().with_disks_per_instance(2), DiskAttachMode::Serialized).await;
    let [first, second] = fx.instance.disks.as_slice() else {
        panic!("expected two disks, got {:?}", fx.instance.disks);
    };
    let stray = fx
        .cloud
        .create_vm(&fx.instance.vm_spec().expect("spec builds"))
        .await
        .expect("create succeeds")
        .cid;
    fx.cloud.attach_out_of_band(&second.cid, &stray);

    let failure = fx
        .migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect_err("second disk is busy");

    assert!(
        matches!(&failure.error, DiskError::Attach { disk, .. } if disk == &second.cid),
        "got {failure:?}"
    );
    let [entry] = failure.unreconciled.as_slice() else {
        panic!("expected one unreconciled disk, got {:?}", failure.unreconciled);
    };
    assert_eq!(entry.disk, second.cid);
    assert_eq!(entry.attached_to, vec![stray]);
    assert_eq!(fx.cloud.disk_holders(&first.cid), vec![fx.old.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.old.cid, &first.cid));
    assert!(!fx.cloud.disk_mounted_on(&fx.new.cid, &first.cid));
}

#[rstest]
#[tokio::test]
async fn restore_moves_disks_back() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Provider).await;
    let disk = fx.disk().clone();
    fx.migrator
        .migrate(&fx.instance.disks, Some(&fx.old), &fx.new)
        .await
        .expect("migration succeeds");

    let unreconciled = fx
        .migrator
        .restore(&fx.instance.disks, &fx.new, Some(&fx.old))
        .await;

    assert!(unreconciled.is_empty());
    assert_eq!(fx.cloud.disk_holders(&disk), vec![fx.old.cid.clone()]);
    assert!(fx.cloud.disk_mounted_on(&fx.old.cid, &disk));
    assert!(!fx.cloud.disk_mounted_on(&fx.new.cid, &disk));
}

#[rstest]
#[tokio::test]
async fn is_attached_reflects_provider_view() {
    let fx = fixture(SimulatedCloud::new(), DiskAttachMode::Provider).await;

    assert!(fx.migrator.is_attached(&fx.old.cid, fx.disk()).await);
    assert!(!fx.migrator.is_attached(&fx.new.cid, fx.disk()).await);
}
