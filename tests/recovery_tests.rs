//! Crash recovery and clean-up of stale operations

mod common;

use assert_matches::assert_matches;
use brickyard::config::{CleanerConfig, OperationsConfig};
use brickyard::executor::{CmdHook, InjectConfig, Reaction};
use brickyard::model::{
    Durability, EntityState, PendingOperationEntry, PendingStatus, VolumeEntry,
};
use brickyard::operations::{
    BlockVolumeCreateOperation, BrickEvictOperation, DeviceAddOperation, DeviceRemoveOperation,
    Operation, VolumeCreateOperation, VolumeExpandOperation,
};
use brickyard::{Cleaner, Error, Store};
use common::Harness;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

fn lvremove_fails() -> InjectConfig {
    InjectConfig {
        cmd_hooks: vec![CmdHook::new(
            "lvremove",
            Reaction::error("Logical volume in use"),
        )],
        ..Default::default()
    }
}

fn replica3(harness: &Harness, name: &str, size: u64) -> VolumeEntry {
    VolumeEntry::new(
        &harness.cluster_id,
        Some(name),
        size,
        Durability::Replicate { replica: 3 },
        None,
        false,
    )
}

/// Same simulated hosts, fresh process state over the persisted store
fn restart(harness: &Harness, path: &Path) -> Harness {
    let store = Store::open(path, Duration::from_secs(1)).unwrap();
    Harness::attach(
        store,
        harness.fake.clone(),
        OperationsConfig::default(),
        harness.cluster_id.clone(),
    )
}

#[derive(Debug, Clone, Copy)]
enum Crash {
    AfterBuild,
    AfterExec,
}

async fn crash<O: Operation>(harness: &Harness, op: &mut O, at: Crash) {
    op.build().unwrap();
    if let Crash::AfterExec = at {
        op.exec(harness.manager.commands()).await.unwrap();
    }
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_refuses_until_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brickyard.db");
    let harness = Harness::persistent(&path).await;

    let mut op = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    crash(&harness, &mut op, Crash::AfterBuild).await;

    let restarted = restart(&harness, &path);
    assert_matches!(restarted.manager.check_stale(), Err(Error::InvalidRequest(_)));
    let pending = restarted.manager.pending_operations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PendingStatus::Stale);

    let report = restarted.manager.clean_pending().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(restarted.manager.check_stale().unwrap(), 0);
}

#[tokio::test]
async fn test_crashed_creates_roll_back() {
    for at in [Crash::AfterBuild, Crash::AfterExec] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brickyard.db");
        let harness = Harness::persistent(&path).await;
        let before = harness.store.snapshot();
        let allocated = harness.fake.allocated();

        let mut volume = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
        crash(&harness, &mut volume, at).await;
        let mut block =
            BlockVolumeCreateOperation::new(harness.ctx(), &harness.cluster_id, None, 5, true);
        crash(&harness, &mut block, at).await;

        let restarted = restart(&harness, &path);
        assert_eq!(restarted.manager.mark_pending_stale().unwrap(), 2);
        let report = restarted.manager.clean_pending().await.unwrap();
        assert_eq!((report.cleaned, report.failed), (2, 0), "{:?}", at);

        assert_eq!(restarted.store.snapshot(), before, "{:?}", at);
        assert_eq!(restarted.fake.allocated(), allocated, "{:?}", at);
        assert!(!restarted.fake.volume_exists("vol1"));
        restarted.assert_conserved();
    }
}

#[tokio::test]
async fn test_crashed_device_add_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brickyard.db");
    let harness = Harness::persistent(&path).await;
    let before = harness.store.snapshot();
    let node = before.nodes.values().next().unwrap().clone();
    harness.fake.add_disk(&node.manage_hostname, "/dev/sdz", common::DISK_SIZE);

    let mut op = DeviceAddOperation::new(harness.ctx(), &node.id, "/dev/sdz");
    crash(&harness, &mut op, Crash::AfterExec).await;
    let vg = format!("vg_{}", op.device_id());
    assert!(harness.fake.volume_group_exists(&node.manage_hostname, &vg));

    let restarted = restart(&harness, &path);
    restarted.manager.mark_pending_stale().unwrap();
    restarted.manager.clean_pending().await.unwrap();
    assert_eq!(restarted.store.snapshot(), before);
    assert!(!restarted.fake.volume_group_exists(&node.manage_hostname, &vg));
}

#[tokio::test]
async fn test_crashed_expand_after_exec_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("brickyard.db");
    let harness = Harness::persistent(&path).await;
    let mut create = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    harness.manager.run(&mut create).await.unwrap();
    let id = create.volume_id().to_string();

    let mut op = VolumeExpandOperation::new(harness.ctx(), &id, 10);
    crash(&harness, &mut op, Crash::AfterExec).await;

    let restarted = restart(&harness, &path);
    restarted.manager.mark_pending_stale().unwrap();
    restarted.manager.clean_pending().await.unwrap();

    let volume = restarted.volume(&id);
    assert_eq!(volume.size, 20);
    assert_eq!(volume.bricks.len(), 6);
    assert!(volume.pending.is_none());
    assert_eq!(restarted.pending_count(), 0);
    restarted.assert_conserved();
}

// =============================================================================
// Failed rollbacks
// =============================================================================

#[tokio::test]
async fn test_evict_lvremove_failure_then_cleanup() {
    let harness = Harness::new().await;
    let mut create = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    harness.manager.run(&mut create).await.unwrap();
    let id = create.volume_id().to_string();
    let original: BTreeSet<String> = harness.volume(&id).bricks.into_iter().collect();
    let victim = original.iter().next().unwrap().clone();

    harness.hooks(lvremove_fails());
    let mut op = BrickEvictOperation::new(harness.ctx(), &victim);
    assert_matches!(harness.manager.run(&mut op).await, Err(Error::Rollback { .. }));
    assert_eq!(harness.pending_count(), 1);
    let pending = harness.manager.pending_operations().unwrap();
    assert_eq!(pending[0].status, PendingStatus::Stale);

    // hooks still active: the cleaner fails and keeps the record
    let report = harness.manager.clean_pending().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(harness.pending_count(), 1);

    harness.inject.clear_hooks();
    harness.manager.mark_pending_stale().unwrap();
    let report = harness.manager.clean_pending().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(harness.pending_count(), 0);

    let now: BTreeSet<String> = harness.volume(&id).bricks.into_iter().collect();
    assert_eq!(now.len(), 3);
    assert_eq!(now.intersection(&original).count(), 2);
    assert!(!now.contains(&victim));
    assert!(!harness.store.snapshot().bricks.contains_key(&victim));
    harness.assert_conserved();
}

#[tokio::test]
async fn test_device_remove_with_stale_child() {
    let harness = Harness::new().await;
    let mut create = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    harness.manager.run(&mut create).await.unwrap();
    let (device, count) = harness
        .devices()
        .into_iter()
        .find(|d| !d.bricks.is_empty())
        .map(|d| (d.id, d.bricks.len()))
        .unwrap();

    harness.hooks(lvremove_fails());
    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    assert_matches!(harness.manager.run(&mut op).await, Err(Error::Rollback { .. }));

    // parent and child both left behind
    let pending = harness.manager.pending_operations().unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|p| p.status == PendingStatus::Stale));
    let report = harness.manager.pending_report().unwrap();
    assert!(report.iter().all(|r| r.problems.is_empty()), "{:?}", report);

    harness.inject.clear_hooks();
    let report = harness.manager.clean_pending().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(harness.pending_count(), 0);

    let tables = harness.store.snapshot();
    assert_eq!(tables.devices[&device].bricks.len(), count - 1);
    assert_eq!(tables.devices[&device].state, EntityState::Offline);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_device_remove_child_left_unmarked() {
    let harness = Harness::new().await;
    let mut create = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    harness.manager.run(&mut create).await.unwrap();
    let device = harness
        .devices()
        .into_iter()
        .find(|d| !d.bricks.is_empty())
        .map(|d| d.id)
        .unwrap();

    harness.hooks(lvremove_fails());
    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    assert_matches!(harness.manager.run(&mut op).await, Err(Error::Rollback { .. }));

    // the child's stale mark never landed
    let child = harness
        .store
        .snapshot()
        .pending_operations
        .values()
        .find(|p| p.parent().is_some())
        .map(|p| p.id.clone())
        .unwrap();
    harness
        .store
        .update(|tx| {
            tx.get_mut::<PendingOperationEntry>(&child)?.status = PendingStatus::New;
            Ok(())
        })
        .unwrap();

    harness.inject.clear_hooks();
    let report = harness.manager.clean_pending().await.unwrap();
    assert_eq!((report.cleaned, report.failed), (1, 0));
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

// =============================================================================
// Background cleaner
// =============================================================================

#[tokio::test]
async fn test_cleaner_pass_cleans_stale() {
    let harness = Harness::new().await;
    let mut create = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    harness.manager.run(&mut create).await.unwrap();
    let victim = harness.volume(create.volume_id()).bricks[0].clone();

    harness.hooks(lvremove_fails());
    let mut op = BrickEvictOperation::new(harness.ctx(), &victim);
    assert!(harness.manager.run(&mut op).await.is_err());
    harness.inject.clear_hooks();

    let cleaner = Cleaner::new(harness.manager.clone(), CleanerConfig::default());
    let report = cleaner.pass().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(cleaner.passes(), 1);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_new_operations_are_not_cleaned() {
    let harness = Harness::new().await;
    let mut op = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
    op.build().unwrap();

    let report = harness.manager.clean_pending().await.unwrap();
    assert_eq!(report.cleaned + report.failed, 0);
    assert_eq!(harness.pending_count(), 1);
}
