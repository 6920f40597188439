//! Operation State Machine
//!
//! Every multi-step storage change is a domain operation driving one
//! [`PendingOperationEntry`] through its lifecycle:
//!
//! ```text
//!   build()     one write transaction: reserve capacity, create/mark
//!               entities pending, insert the record (status New)
//!   exec()      remote commands only; progress that must survive a crash
//!               is appended to the record in small transactions
//!   finalize()  one write transaction: clear pending ids, delete record
//!   rollback()  undo remote effects, then restore the store
//!   clean()     inspect remote state and decide: finish or reverse
//!   clean_done() store side of clean, deletes the record
//! ```
//!
//! Records left behind by a crash or a failed rollback are reloaded with
//! [`load_operation`] and driven through `clean` + `clean_done`.

pub mod block_volume;
pub mod brick_evict;
pub mod device;
mod hosts;
pub mod volume;

pub use block_volume::{
    BlockVolumeCreateOperation, BlockVolumeDeleteOperation, BlockVolumeExpandOperation,
};
pub use brick_evict::BrickEvictOperation;
pub use device::{DeviceAddOperation, DeviceRemoveOperation};
pub use volume::{VolumeCreateOperation, VolumeDeleteOperation, VolumeExpandOperation};

use crate::capacity::{BrickReservation, ThinPoolSizing, GIB};
use crate::config::OperationsConfig;
use crate::error::{Error, Result};
use crate::executor::commands::StorageCommands;
use crate::model::{
    ActionKind, BlockVolumeEntry, BrickEntry, ChangeType, DeviceEntry, NodeEntry, OperationKind,
    PendingOperationEntry, PendingStatus, VolumeEntry,
};
use crate::placement::{Candidate, Placer, PlacementRequest, SimplePlacer};
use crate::store::{Store, TxRead, WriteTx};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Operation contract
// =============================================================================

#[async_trait]
pub trait Operation: Send {
    /// Id of the pending operation record
    fn id(&self) -> &str;

    fn label(&self) -> &'static str;

    fn kind(&self) -> OperationKind;

    /// Times the manager may roll back, rebuild and re-run after exec asks
    /// for a retry
    fn max_retries(&self) -> usize {
        0
    }

    fn build(&mut self) -> Result<()>;

    async fn exec(&mut self, commands: &StorageCommands) -> Result<()>;

    fn finalize(&mut self) -> Result<()>;

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()>;

    /// Reconcile remote state for a record left behind; no store writes
    async fn clean(&mut self, commands: &StorageCommands) -> Result<()>;

    /// Store side of [`Operation::clean`]; deletes the record
    fn clean_done(&mut self) -> Result<()>;
}

/// Rollback expressed as a clean pass, for operations whose undo has to
/// look at the remote side first
pub(crate) async fn rollback_via_clean(
    op: &mut dyn Operation,
    commands: &StorageCommands,
) -> Result<()> {
    op.clean(commands).await?;
    op.clean_done()
}

// =============================================================================
// Shared state
// =============================================================================

/// Everything an operation needs besides the executor
#[derive(Clone)]
pub struct OperationContext {
    pub store: Store,
    pub sizing: ThinPoolSizing,
    pub placer: Arc<dyn Placer>,
    pub config: OperationsConfig,
}

impl OperationContext {
    pub fn new(store: Store, config: &OperationsConfig) -> Self {
        Self {
            store,
            sizing: ThinPoolSizing::new(config.snapshot_factor),
            placer: Arc::new(SimplePlacer),
            config: config.clone(),
        }
    }

    pub fn with_placer(mut self, placer: Arc<dyn Placer>) -> Self {
        self.placer = placer;
        self
    }
}

/// Context plus the record an operation owns
pub struct OpCore {
    pub ctx: OperationContext,
    pub entry: PendingOperationEntry,
}

impl OpCore {
    pub fn new(ctx: OperationContext, kind: OperationKind) -> Self {
        Self {
            ctx,
            entry: PendingOperationEntry::new(kind),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Self {
        Self { ctx, entry }
    }

    /// Forget recorded actions before a rebuild, keeping the id
    pub fn reset(&mut self) {
        self.entry.actions.clear();
        self.entry.status = PendingStatus::New;
    }

    /// Re-read the record; exec may have appended actions
    pub fn refresh(&mut self) -> Result<()> {
        let id = self.entry.id.clone();
        self.entry = self.ctx.store.view(|tx| tx.get(&id))?;
        Ok(())
    }

    pub fn is_recorded(&self) -> Result<bool> {
        self.ctx
            .store
            .view(|tx| Ok(tx.contains::<PendingOperationEntry>(&self.entry.id)))
    }

    /// Delete the record and detach it from its parent, if any
    pub fn delete(&self, tx: &mut WriteTx<'_>) -> Result<()> {
        if let Some(parent) = self.entry.parent() {
            if let Ok(p) = tx.get_mut::<PendingOperationEntry>(parent) {
                p.clear_child();
            }
        }
        tx.delete::<PendingOperationEntry>(&self.entry.id)?;
        Ok(())
    }
}

/// Rebuild the domain operation that owns a persisted record
pub fn load_operation(
    ctx: OperationContext,
    entry: PendingOperationEntry,
) -> Result<Box<dyn Operation>> {
    Ok(match entry.kind {
        OperationKind::DeviceAdd => Box::new(DeviceAddOperation::load(ctx, entry)?),
        OperationKind::DeviceRemove => Box::new(DeviceRemoveOperation::load(ctx, entry)?),
        OperationKind::BrickEvict => Box::new(BrickEvictOperation::load(ctx, entry)?),
        OperationKind::VolumeCreate => Box::new(VolumeCreateOperation::load(ctx, entry)?),
        OperationKind::VolumeExpand => Box::new(VolumeExpandOperation::load(ctx, entry)?),
        OperationKind::VolumeDelete => Box::new(VolumeDeleteOperation::load(ctx, entry)?),
        OperationKind::BlockVolumeCreate => {
            Box::new(BlockVolumeCreateOperation::load(ctx, entry)?)
        }
        OperationKind::BlockVolumeExpand => {
            Box::new(BlockVolumeExpandOperation::load(ctx, entry)?)
        }
        OperationKind::BlockVolumeDelete => {
            Box::new(BlockVolumeDeleteOperation::load(ctx, entry)?)
        }
    })
}

/// Id recorded under `change`, or an error naming the malformed record
pub(crate) fn required_action(entry: &PendingOperationEntry, change: ChangeType) -> Result<String> {
    entry
        .first_of(change)
        .map(|a| a.id.clone())
        .ok_or_else(|| {
            Error::Internal(format!(
                "{} operation {} has no {:?} action",
                entry.kind, entry.id, change
            ))
        })
}

/// Problems with a record's references: missing entities, or add/delete
/// targets that do not carry the record's pending id
pub fn consistency_check<T: TxRead + ?Sized>(tx: &T, entry: &PendingOperationEntry) -> Vec<String> {
    let mut problems = Vec::new();
    for action in &entry.actions {
        let pending = match action.change.entity_kind() {
            "brick" => tx.find::<BrickEntry>(&action.id).map(|e| e.pending.clone()),
            "volume" => tx.find::<VolumeEntry>(&action.id).map(|e| e.pending.clone()),
            "block_volume" => tx
                .find::<BlockVolumeEntry>(&action.id)
                .map(|e| e.pending.clone()),
            "device" => tx.find::<DeviceEntry>(&action.id).map(|e| e.pending.clone()),
            _ => tx
                .find::<PendingOperationEntry>(&action.id)
                .map(|_| Some(entry.id.clone())),
        };
        match pending {
            None => problems.push(format!(
                "{:?} references missing {} {}",
                action.change,
                action.change.entity_kind(),
                action.id
            )),
            Some(owner)
                if action.change.action_kind() != ActionKind::Marker
                    && owner.as_deref() != Some(entry.id.as_str()) =>
            {
                problems.push(format!(
                    "{} {} is not marked pending by {}",
                    action.change.entity_kind(),
                    action.id,
                    entry.id
                ))
            }
            Some(_) => {}
        }
    }
    problems
}

// =============================================================================
// Brick helpers shared by the volume, evict and block operations
// =============================================================================

/// A brick with the hostnames needed to reach and name it
#[derive(Debug, Clone)]
pub(crate) struct HostedBrick {
    pub brick: BrickEntry,
    /// Host commands are sent to
    pub manage_host: String,
    /// Host in the gluster brick name
    pub storage_host: String,
}

impl HostedBrick {
    /// `host:/path` as gluster reports it
    pub fn gluster_name(&self) -> String {
        format!("{}:{}", self.storage_host, self.brick.path())
    }
}

pub(crate) fn hosted_bricks<'a, T: TxRead + ?Sized>(
    tx: &T,
    ids: impl IntoIterator<Item = &'a String>,
) -> Result<Vec<HostedBrick>> {
    ids.into_iter()
        .map(|id| {
            let brick: BrickEntry = tx.get(id)?;
            let node: NodeEntry = tx.get(&brick.node_id)?;
            Ok(HostedBrick {
                brick,
                manage_host: node.manage_hostname,
                storage_host: node.storage_hostname,
            })
        })
        .collect()
}

/// Manage hosts of a set of bricks, in brick order without duplicates
pub(crate) fn manage_hosts(bricks: &[HostedBrick]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for b in bricks {
        if !hosts.contains(&b.manage_host) {
            hosts.push(b.manage_host.clone());
        }
    }
    hosts
}

/// Create bricks in parallel; returns the bricks that failed
pub(crate) async fn create_bricks<'b>(
    commands: &StorageCommands,
    bricks: &'b [HostedBrick],
) -> Vec<(&'b HostedBrick, Error)> {
    let results = join_all(
        bricks
            .iter()
            .map(|b| async move { (b, commands.brick_create(&b.manage_host, &b.brick).await) }),
    )
    .await;
    results
        .into_iter()
        .filter_map(|(b, r)| r.err().map(|e| (b, e)))
        .collect()
}

/// Destroy bricks in parallel; brick id -> whether its space came back
pub(crate) async fn destroy_bricks(
    commands: &StorageCommands,
    bricks: &[HostedBrick],
) -> Result<BTreeMap<String, bool>> {
    let results = join_all(bricks.iter().map(|b| async move {
        commands
            .brick_destroy(&b.manage_host, &b.brick)
            .await
            .map(|reclaimed| (b.brick.id.clone(), reclaimed))
    }))
    .await;
    results.into_iter().collect()
}

/// Delete a brick record, unlink it from its device and give the space back
pub(crate) fn free_brick(tx: &mut WriteTx<'_>, brick_id: &str, reclaimed: bool) -> Result<()> {
    let brick: BrickEntry = tx.delete(brick_id)?;
    let device = tx.get_mut::<DeviceEntry>(&brick.device_id)?;
    device.remove_brick(brick_id);
    if reclaimed {
        device.storage_free(brick.total_size())?;
    } else {
        warn!(
            brick = brick_id,
            device = %brick.device_id,
            "thin pool not removed, space stays charged to the device"
        );
    }
    Ok(())
}

/// Usable devices of a cluster as placement candidates
pub(crate) fn candidates<T: TxRead + ?Sized>(tx: &T, cluster_id: &str) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    for node in tx.list::<NodeEntry>() {
        if node.cluster_id != cluster_id || !node.is_online() {
            continue;
        }
        for device_id in &node.devices {
            let device: DeviceEntry = tx.get(device_id)?;
            if device.is_usable() {
                out.push(Candidate {
                    node_id: node.id.clone(),
                    device_id: device.id.clone(),
                    zone: node.zone,
                    free: device.storage.free,
                });
            }
        }
    }
    Ok(out)
}

/// Charge a device for a new pending brick and insert it
pub(crate) fn allocate_brick(
    tx: &mut WriteTx<'_>,
    entry: &mut PendingOperationEntry,
    volume: &VolumeEntry,
    node_id: &str,
    device_id: &str,
    reservation: BrickReservation,
) -> Result<BrickEntry> {
    let mut brick = BrickEntry::new(&volume.id, node_id, device_id, reservation, volume.gid);
    brick.pending = Some(entry.id.clone());
    let device = tx.get_mut::<DeviceEntry>(device_id)?;
    device.storage_allocate(reservation.total())?;
    device.add_brick(&brick.id);
    tx.insert(brick.clone())?;
    entry.record(ChangeType::AddBrick, &brick.id);
    Ok(brick)
}

/// Place and allocate every brick for `size_gb` more of `volume`.
///
/// The brick count grows in whole sets until each brick is no larger than
/// the configured maximum.
pub(crate) fn allocate_bricks(
    ctx: &OperationContext,
    tx: &mut WriteTx<'_>,
    entry: &mut PendingOperationEntry,
    volume: &VolumeEntry,
    size_gb: u64,
    exclude_devices: &[String],
) -> Result<Vec<BrickEntry>> {
    volume.durability.validate()?;
    let max = ctx.config.brick_max_size_gb * GIB;
    let min = ctx.config.brick_min_size_gb * GIB;

    let mut sets = 1u64;
    let mut brick_size = volume.durability.brick_size(size_gb * GIB);
    while brick_size > max {
        sets *= 2;
        brick_size = volume.durability.brick_size((size_gb * GIB).div_ceil(sets));
    }
    if brick_size < min {
        return Err(Error::InvalidRequest(format!(
            "brick size {} KiB is below the minimum of {} GiB",
            brick_size, ctx.config.brick_min_size_gb
        )));
    }

    let reservation = ctx.sizing.reservation(brick_size);
    let request = PlacementRequest {
        sets: sets as usize,
        set_size: volume.durability.set_size(),
        reservation: reservation.total(),
        exclude_nodes: Vec::new(),
        exclude_devices: exclude_devices.to_vec(),
    };
    let placements = ctx
        .placer
        .place(&candidates(&*tx, &volume.cluster_id)?, &request)?;

    let mut bricks = Vec::new();
    for placement in placements.iter().flatten() {
        bricks.push(allocate_brick(
            tx,
            entry,
            volume,
            &placement.node_id,
            &placement.device_id,
            reservation,
        )?);
    }
    info!(
        volume = %volume.name,
        sets,
        brick_size,
        bricks = bricks.len(),
        "bricks allocated"
    );
    Ok(bricks)
}
