//! End-to-end operation tests against the simulated cluster

mod common;

use assert_matches::assert_matches;
use brickyard::executor::{CmdHook, InjectConfig, Reaction, ResultHook};
use brickyard::model::{Durability, VolumeEntry};
use brickyard::operations::{
    BlockVolumeCreateOperation, BlockVolumeDeleteOperation, BlockVolumeExpandOperation,
    BrickEvictOperation, DeviceRemoveOperation, Operation, VolumeCreateOperation,
    VolumeDeleteOperation, VolumeExpandOperation,
};
use brickyard::Error;
use common::{hostname, Harness};
use proptest::prelude::*;
use std::collections::BTreeSet;

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

async fn create_volume(harness: &Harness, name: &str, size: u64) -> String {
    let mut op = VolumeCreateOperation::new(harness.ctx(), replica3(harness, name, size));
    harness.manager.run(&mut op).await.unwrap();
    op.volume_id().to_string()
}

fn cmd_hook(cmd: &str, err: &str) -> InjectConfig {
    InjectConfig {
        cmd_hooks: vec![CmdHook::new(cmd, Reaction::error(err))],
        ..Default::default()
    }
}

// =============================================================================
// Devices and volumes
// =============================================================================

#[tokio::test]
async fn test_devices_registered() {
    let harness = Harness::new().await;
    let devices = harness.devices();
    assert_eq!(devices.len(), common::NODES * common::DEVICES_PER_NODE);
    assert!(devices.iter().all(|d| d.pending.is_none() && d.storage.total > 0));
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_volume_lifecycle_conserves_capacity() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let volume = harness.volume(&id);
    assert_eq!(volume.bricks.len(), 3);
    assert!(volume.pending.is_none());
    assert!(harness.fake.volume_exists("vol1"));
    harness.assert_conserved();

    let mut expand = VolumeExpandOperation::new(harness.ctx(), &id, 10);
    harness.manager.run(&mut expand).await.unwrap();
    let volume = harness.volume(&id);
    assert_eq!(volume.size, 20);
    assert_eq!(volume.bricks.len(), 6);
    assert_eq!(harness.fake.volume_bricks("vol1").unwrap().len(), 6);
    harness.assert_conserved();

    let mut delete = VolumeDeleteOperation::new(harness.ctx(), &id);
    harness.manager.run(&mut delete).await.unwrap();
    assert!(!harness.fake.volume_exists("vol1"));
    assert!(harness.store.snapshot().volumes.is_empty());
    assert!(harness.store.snapshot().bricks.is_empty());
    assert_eq!(harness.used(), 0);
    harness.assert_conserved();
    assert_eq!(harness.pending_count(), 0);
}

#[tokio::test]
async fn test_volume_create_failures_converge() {
    for (cmd, err) in [
        ("lvcreate", "Insufficient free space"),
        ("mkfs.xfs", "mkfs.xfs: cannot open device"),
        ("volume create", "volume create: failed: staging failed"),
        ("volume start", "volume start: failed: commit failed"),
    ] {
        let harness = Harness::new().await;
        let before = harness.store.snapshot();
        let allocated = harness.fake.allocated();

        harness.hooks(cmd_hook(cmd, err));
        let mut op = VolumeCreateOperation::new(harness.ctx(), replica3(&harness, "vol1", 10));
        assert!(harness.manager.run(&mut op).await.is_err(), "{} should fail", cmd);

        assert_eq!(harness.store.snapshot(), before, "store differs after {}", cmd);
        assert_eq!(harness.fake.allocated(), allocated, "hosts differ after {}", cmd);
        assert!(!harness.fake.volume_exists("vol1"));
    }
}

#[tokio::test]
async fn test_volume_expand_failure_converges() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let before = harness.store.snapshot();

    harness.hooks(cmd_hook("add-brick", "volume add-brick: failed: commit failed"));
    let mut op = VolumeExpandOperation::new(harness.ctx(), &id, 10);
    assert_matches!(harness.manager.run(&mut op).await, Err(Error::Command { .. }));

    assert_eq!(harness.store.snapshot(), before);
    assert_eq!(harness.fake.volume_bricks("vol1").unwrap().len(), 3);
    harness.assert_conserved();
}

// =============================================================================
// Ownership
// =============================================================================

#[tokio::test]
async fn test_one_owner_per_volume() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;

    let mut expand = VolumeExpandOperation::new(harness.ctx(), &id, 5);
    let mut delete = VolumeDeleteOperation::new(harness.ctx(), &id);
    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking(move || expand.build()),
        tokio::task::spawn_blocking(move || delete.build()),
    );
    let results = [a.unwrap().is_ok(), b.unwrap().is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(harness.pending_count(), 1);
    assert!(harness.volume(&id).pending.is_some());
}

#[tokio::test]
async fn test_one_owner_per_brick() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let brick = harness.volume(&id).bricks[0].clone();

    let mut first = BrickEvictOperation::new(harness.ctx(), &brick);
    let mut second = BrickEvictOperation::new(harness.ctx(), &brick);
    first.build().unwrap();
    assert_matches!(second.build(), Err(Error::Conflict(_)));
    assert_eq!(harness.pending_count(), 1);
}

#[tokio::test]
async fn test_one_owner_between_evict_and_expand() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let brick = harness.volume(&id).bricks[0].clone();

    let mut evict = BrickEvictOperation::new(harness.ctx(), &brick);
    let mut expand = VolumeExpandOperation::new(harness.ctx(), &id, 5);
    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking(move || evict.build()),
        tokio::task::spawn_blocking(move || expand.build()),
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(Error::Conflict(_)));
    }
    assert_eq!(harness.pending_count(), 1);

    // evict first, then expand: the brick lock alone must refuse the expand
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let brick = harness.volume(&id).bricks[0].clone();
    let mut evict = BrickEvictOperation::new(harness.ctx(), &brick);
    evict.build().unwrap();
    let mut expand = VolumeExpandOperation::new(harness.ctx(), &id, 5);
    assert_matches!(expand.build(), Err(Error::Conflict(_)));
    assert_eq!(harness.pending_count(), 1);
}

// =============================================================================
// Brick eviction
// =============================================================================

#[tokio::test]
async fn test_evict_one_replica_brick() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let original: BTreeSet<String> = harness.volume(&id).bricks.into_iter().collect();
    let used = harness.used();

    let victim = original.iter().next().unwrap().clone();
    let mut op = BrickEvictOperation::new(harness.ctx(), &victim);
    harness.manager.run(&mut op).await.unwrap();

    let now: BTreeSet<String> = harness.volume(&id).bricks.into_iter().collect();
    assert_eq!(now.len(), 3);
    assert_eq!(now.intersection(&original).count(), 2);
    assert!(!now.contains(&victim));
    assert_eq!(harness.used(), used);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();

    let tables = harness.store.snapshot();
    let gluster = harness.fake.volume_bricks("vol1").unwrap();
    for brick in now.iter().map(|b| &tables.bricks[b]) {
        let host = &tables.nodes[&brick.node_id].storage_hostname;
        assert!(gluster.contains(&format!("{}:{}", host, brick.path())));
    }
}

#[tokio::test]
async fn test_evict_all_bricks_concurrently() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let original = harness.volume(&id).bricks;
    let used = harness.used();

    let mut ops: Vec<BrickEvictOperation> = original
        .iter()
        .map(|b| BrickEvictOperation::new(harness.ctx(), b))
        .collect();
    let manager = &harness.manager;
    let results =
        futures::future::join_all(ops.iter_mut().map(|op| manager.run(op))).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert!(succeeded >= 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(Error::Conflict(_)));
    }

    let now: BTreeSet<String> = harness.volume(&id).bricks.into_iter().collect();
    let kept = original.iter().filter(|b| now.contains(*b)).count();
    assert_eq!(now.len(), 3);
    assert_eq!(kept, 3 - succeeded);
    assert_eq!(harness.used(), used);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_evict_replace_brick_failure_reverts() {
    let harness = Harness::new().await;
    let id = create_volume(&harness, "vol1", 10).await;
    let before = harness.store.snapshot();
    let allocated = harness.fake.allocated();

    harness.hooks(cmd_hook("replace-brick", "volume replace-brick: failed: commit failed"));
    let victim = harness.volume(&id).bricks[1].clone();
    let mut op = BrickEvictOperation::new(harness.ctx(), &victim);
    assert!(harness.manager.run(&mut op).await.is_err());

    assert_eq!(harness.store.snapshot(), before);
    assert_eq!(harness.fake.allocated(), allocated);
}

// =============================================================================
// Device removal
// =============================================================================

fn loaded_device(harness: &Harness) -> (String, usize) {
    harness
        .devices()
        .into_iter()
        .find(|d| !d.bricks.is_empty())
        .map(|d| (d.id, d.bricks.len()))
        .unwrap()
}

#[tokio::test]
async fn test_device_remove_moves_bricks() {
    let harness = Harness::new().await;
    create_volume(&harness, "vol1", 10).await;
    let (device, _) = loaded_device(&harness);

    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    harness.manager.run(&mut op).await.unwrap();

    let tables = harness.store.snapshot();
    assert!(tables.devices[&device].bricks.is_empty());
    assert_eq!(tables.devices[&device].storage.used, 0);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_device_remove_empty_device() {
    let harness = Harness::new().await;
    let device = harness.devices()[0].id.clone();
    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    harness.manager.run(&mut op).await.unwrap();
    assert_eq!(harness.pending_count(), 0);
}

#[tokio::test]
async fn test_device_remove_replace_fails_before_switch() {
    let harness = Harness::new().await;
    create_volume(&harness, "vol1", 10).await;
    let (device, count) = loaded_device(&harness);

    harness.hooks(cmd_hook("replace-brick", "volume replace-brick: failed: commit failed"));
    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    assert!(harness.manager.run(&mut op).await.is_err());

    let tables = harness.store.snapshot();
    assert_eq!(tables.devices[&device].bricks.len(), count);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

#[tokio::test]
async fn test_device_remove_replace_fails_after_switch() {
    let harness = Harness::new().await;
    create_volume(&harness, "vol1", 10).await;
    let (device, count) = loaded_device(&harness);

    // gluster takes the new brick, then the command reports failure
    harness.hooks(InjectConfig {
        result_hooks: vec![ResultHook::new(
            "replace-brick",
            "success",
            Reaction::output("", Some("volume replace-brick: failed: commit failed")),
        )],
        ..Default::default()
    });
    let mut op = DeviceRemoveOperation::new(harness.ctx(), &device);
    assert!(harness.manager.run(&mut op).await.is_err());

    let tables = harness.store.snapshot();
    assert_eq!(tables.devices[&device].bricks.len(), count - 1);
    assert_eq!(harness.pending_count(), 0);
    harness.assert_conserved();
}

// =============================================================================
// Block volumes
// =============================================================================

fn hosting_free(harness: &Harness, block_id: &str) -> u64 {
    let tables = harness.store.snapshot();
    let block = &tables.block_volumes[block_id];
    tables.volumes[&block.hosting_volume_id]
        .block_info
        .as_ref()
        .unwrap()
        .free_size
}

async fn create_block(harness: &Harness, size: u64) -> String {
    let mut op =
        BlockVolumeCreateOperation::new(harness.ctx(), &harness.cluster_id, Some("blk1"), size, false);
    harness.manager.run(&mut op).await.unwrap();
    op.block_volume_id().to_string()
}

/// `gluster-block info` as reported when one host kept the old size
fn partial_info(hosting: &str, size: u64, stuck_at: u64) -> String {
    let mut failed = serde_json::Map::new();
    failed.insert(hostname(2), format!("{}.0 GiB", stuck_at).into());
    serde_json::json!({
        "NAME": "blk1",
        "VOLUME": hosting,
        "SIZE": format!("{}.0 GiB", size),
        "EXPORTED ON": [hostname(0), hostname(1), hostname(2)],
        "RESIZE FAILED ON": failed,
        "RESULT": "SUCCESS",
    })
    .to_string()
}

fn version_check_failure() -> Reaction {
    Reaction::output(
        serde_json::json!({
            "RESULT": "FAIL",
            "errCode": 255,
            "errMsg": "host2: version check failed [remote version 0.3 < 0.4]",
        })
        .to_string(),
        Some("exit status 255"),
    )
}

#[tokio::test]
async fn test_block_volume_create_and_delete() {
    let harness = Harness::new().await;
    let id = create_block(&harness, 1).await;
    let tables = harness.store.snapshot();
    let block = &tables.block_volumes[&id];
    let hosting = &tables.volumes[&block.hosting_volume_id];
    assert!(block.iqn.as_deref().is_some_and(|iqn| iqn.starts_with("iqn.")));
    assert_eq!(block.hosts.len(), 3);
    assert_eq!(hosting.block_info.as_ref().unwrap().free_size, 100 - 2 - 1);
    assert!(tables.clusters[&harness.cluster_id].block_volumes.contains(&id));
    assert!(harness
        .fake
        .block_volume_size(&hosting.name, &block.name)
        .is_some());

    let hosting_name = hosting.name.clone();
    let mut delete = BlockVolumeDeleteOperation::new(harness.ctx(), &id);
    harness.manager.run(&mut delete).await.unwrap();
    assert!(harness.fake.block_volume_size(&hosting_name, "blk1").is_none());
    let tables = harness.store.snapshot();
    assert!(tables.block_volumes.is_empty());
    let hosting = tables.volumes.values().next().unwrap();
    assert_eq!(hosting.block_info.as_ref().unwrap().free_size, 100 - 2);
    assert_eq!(harness.pending_count(), 0);
}

#[tokio::test]
async fn test_block_expand_partial_then_retry() {
    let harness = Harness::new().await;
    let id = create_block(&harness, 1).await;
    let free = hosting_free(&harness, &id);
    let hosting = {
        let tables = harness.store.snapshot();
        tables.volumes[&tables.block_volumes[&id].hosting_volume_id]
            .name
            .clone()
    };

    harness.hooks(InjectConfig {
        result_hooks: vec![
            ResultHook::new("gluster-block modify", "SUCCESS", version_check_failure()),
            ResultHook::new(
                "gluster-block info",
                ".*",
                Reaction::output(partial_info(&hosting, 2, 1), None),
            ),
        ],
        ..Default::default()
    });
    let mut op = BlockVolumeExpandOperation::new(harness.ctx(), &id, 2);
    assert_matches!(harness.manager.run(&mut op).await, Err(Error::Command { .. }));

    let block = harness.store.snapshot().block_volumes[&id].clone();
    assert_eq!((block.size, block.usable_size), (2, 1));
    assert!(block.pending.is_none());
    assert_eq!(hosting_free(&harness, &id), free - 1);
    assert_eq!(harness.pending_count(), 0);

    // same size again once every host cooperates
    harness.inject.clear_hooks();
    let mut retry = BlockVolumeExpandOperation::new(harness.ctx(), &id, 2);
    harness.manager.run(&mut retry).await.unwrap();
    let block = harness.store.snapshot().block_volumes[&id].clone();
    assert_eq!((block.size, block.usable_size), (2, 2));
    assert_eq!(hosting_free(&harness, &id), free - 1);
}

#[tokio::test]
async fn test_block_expand_partial_then_larger() {
    let harness = Harness::new().await;
    let id = create_block(&harness, 2).await;
    let free = hosting_free(&harness, &id);
    let hosting = {
        let tables = harness.store.snapshot();
        tables.volumes[&tables.block_volumes[&id].hosting_volume_id]
            .name
            .clone()
    };

    for (target, expected) in [(3, (3, 2)), (4, (4, 2))] {
        harness.hooks(InjectConfig {
            result_hooks: vec![
                ResultHook::new("gluster-block modify", "SUCCESS", version_check_failure()),
                ResultHook::new(
                    "gluster-block info",
                    ".*",
                    Reaction::output(partial_info(&hosting, target, 2), None),
                ),
            ],
            ..Default::default()
        });
        let mut op = BlockVolumeExpandOperation::new(harness.ctx(), &id, target);
        assert!(harness.manager.run(&mut op).await.is_err());
        let block = harness.store.snapshot().block_volumes[&id].clone();
        assert_eq!((block.size, block.usable_size), expected);
    }
    assert_eq!(hosting_free(&harness, &id), free - 2);
}

#[tokio::test]
async fn test_block_expand_total_failure_gives_back() {
    let harness = Harness::new().await;
    let id = create_block(&harness, 1).await;
    let free = hosting_free(&harness, &id);

    harness.hooks(cmd_hook("gluster-block modify", "connection refused"));
    let mut op = BlockVolumeExpandOperation::new(harness.ctx(), &id, 2);
    assert!(harness.manager.run(&mut op).await.is_err());

    let block = harness.store.snapshot().block_volumes[&id].clone();
    assert_eq!((block.size, block.usable_size), (1, 1));
    assert_eq!(hosting_free(&harness, &id), free);
    assert_eq!(harness.pending_count(), 0);
}

// =============================================================================
// Capacity conservation over random sequences
// =============================================================================

#[derive(Debug, Clone)]
enum Step {
    Create(u64),
    Expand(usize, u64),
    Delete(usize),
    Evict(usize, usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1u64..40).prop_map(Step::Create),
        (0usize..8, 1u64..20).prop_map(|(v, d)| Step::Expand(v, d)),
        (0usize..8).prop_map(Step::Delete),
        (0usize..8, 0usize..3).prop_map(|(v, b)| Step::Evict(v, b)),
    ]
}

fn pick(volumes: &[String], i: usize) -> Option<String> {
    (!volumes.is_empty()).then(|| volumes[i % volumes.len()].clone())
}

async fn apply(harness: &Harness, volumes: &mut Vec<String>, n: usize, step: Step) {
    let result = match step {
        Step::Create(size) => {
            let mut op = VolumeCreateOperation::new(
                harness.ctx(),
                replica3(harness, &format!("vol{}", n), size),
            );
            let result = harness.manager.run(&mut op).await;
            if result.is_ok() {
                volumes.push(op.volume_id().to_string());
            }
            result
        }
        Step::Expand(i, delta) => match pick(volumes, i) {
            Some(id) => {
                let mut op = VolumeExpandOperation::new(harness.ctx(), &id, delta);
                harness.manager.run(&mut op).await
            }
            None => Ok(()),
        },
        Step::Delete(i) => match pick(volumes, i) {
            Some(id) => {
                let mut op = VolumeDeleteOperation::new(harness.ctx(), &id);
                let result = harness.manager.run(&mut op).await;
                if result.is_ok() {
                    volumes.retain(|v| *v != id);
                }
                result
            }
            None => Ok(()),
        },
        Step::Evict(i, b) => match pick(volumes, i) {
            Some(id) => {
                let bricks = harness.volume(&id).bricks;
                let mut op = BrickEvictOperation::new(harness.ctx(), &bricks[b % bricks.len()]);
                harness.manager.run(&mut op).await
            }
            None => Ok(()),
        },
    };
    if let Err(e) = result {
        assert_matches!(e, Error::NoSpace(_) | Error::InvalidRequest(_));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_capacity_conserved(steps in prop::collection::vec(step(), 1..10)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let harness = Harness::new().await;
            let mut volumes = Vec::new();
            for (n, step) in steps.into_iter().enumerate() {
                apply(&harness, &mut volumes, n, step).await;
                harness.assert_conserved();
                assert_eq!(harness.pending_count(), 0);
            }
        });
    }
}
