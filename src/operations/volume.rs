//! Volume create, expand and delete
//!
//! ```text
//!   create   build: place bricks, volume + bricks pending
//!            exec:  create bricks ─▶ volume create + start
//!            a brick that fails to create asks for a retry; the rebuild
//!            keeps the volume id and avoids the failing device
//!   expand   build: place new bricks, record ExpandVolume(delta)
//!            exec:  create bricks ─▶ add-brick
//!   delete   build: volume + bricks pending
//!            exec:  stop + delete ─▶ destroy bricks
//! ```

use super::{
    allocate_bricks, create_bricks, destroy_bricks, free_brick, hosted_bricks,
    hosts::first_reachable, manage_hosts, required_action, rollback_via_clean, HostedBrick,
    OpCore, Operation, OperationContext,
};
use crate::error::{Error, Result};
use crate::executor::commands::{StorageCommands, VolumeRequest};
use crate::model::{
    BrickEntry, ChangeType, ClusterEntry, OperationKind, PendingOperationEntry, VolumeEntry,
};
use crate::store::{TxRead, WriteTx};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

// =============================================================================
// Shared steps, also used for block hosting volumes
// =============================================================================

/// Place bricks for a new volume and insert it pending on `entry`
pub(crate) fn build_volume(
    ctx: &OperationContext,
    tx: &mut WriteTx<'_>,
    entry: &mut PendingOperationEntry,
    volume: &mut VolumeEntry,
    exclude_devices: &[String],
) -> Result<()> {
    tx.get::<ClusterEntry>(&volume.cluster_id)?;
    let taken = tx.list::<VolumeEntry>().iter().any(|v| {
        v.cluster_id == volume.cluster_id && v.name == volume.name && v.id != volume.id
    });
    if taken {
        return Err(Error::Conflict(format!(
            "volume name {} already in use",
            volume.name
        )));
    }

    let size = volume.size;
    let bricks = allocate_bricks(ctx, tx, entry, volume, size, exclude_devices)?;
    volume.bricks = bricks.into_iter().map(|b| b.id).collect();
    volume.pending = Some(entry.id.clone());
    entry.record(ChangeType::AddVolume, &volume.id);
    tx.insert(volume.clone())
}

fn volume_bricks(ctx: &OperationContext, volume: &VolumeEntry) -> Result<Vec<HostedBrick>> {
    ctx.store.view(|tx| hosted_bricks(tx, &volume.bricks))
}

/// Create the bricks and start the volume. Devices whose brick failed are
/// appended to `failed_devices` and the error asks for a retry.
pub(crate) async fn create_volume(
    ctx: &OperationContext,
    commands: &StorageCommands,
    volume: &VolumeEntry,
    failed_devices: &mut Vec<String>,
) -> Result<()> {
    let bricks = volume_bricks(ctx, volume)?;
    let failures = create_bricks(commands, &bricks).await;
    if let Some((_, first)) = failures.first() {
        warn!(
            volume = %volume.name,
            failed = failures.len(),
            error = %first,
            "brick creation failed"
        );
    }
    let mut failures = failures.into_iter();
    if let Some((brick, err)) = failures.next() {
        failed_devices.push(brick.brick.device_id.clone());
        failed_devices.extend(failures.map(|(b, _)| b.brick.device_id.clone()));
        return Err(Error::Retry(Box::new(err)));
    }

    let request = VolumeRequest {
        name: volume.name.clone(),
        durability: volume.durability,
        bricks: bricks.iter().map(HostedBrick::gluster_name).collect(),
    };
    let request = &request;
    first_reachable(&manage_hosts(&bricks), |host| {
        async move { commands.volume_create(&host, request).await }.boxed()
    })
    .await
}

/// Stop and delete a volume, then destroy its bricks
pub(crate) async fn destroy_volume(
    ctx: &OperationContext,
    commands: &StorageCommands,
    volume: &VolumeEntry,
) -> Result<BTreeMap<String, bool>> {
    let bricks = volume_bricks(ctx, volume)?;
    let name = volume.name.as_str();
    first_reachable(&manage_hosts(&bricks), |host| {
        async move { commands.volume_destroy(&host, name).await }.boxed()
    })
    .await?;
    destroy_bricks(commands, &bricks).await
}

/// Drop a volume and its bricks from the store
pub(crate) fn remove_volume(
    tx: &mut WriteTx<'_>,
    volume_id: &str,
    reclaimed: &BTreeMap<String, bool>,
) -> Result<()> {
    let volume: VolumeEntry = tx.delete(volume_id)?;
    for id in &volume.bricks {
        if tx.contains::<BrickEntry>(id) {
            free_brick(tx, id, reclaimed.get(id).copied().unwrap_or(false))?;
        }
    }
    if let Ok(cluster) = tx.get_mut::<ClusterEntry>(&volume.cluster_id) {
        cluster.remove_volume(volume_id);
    }
    Ok(())
}

/// Clear pending marks of a volume that is now live
pub(crate) fn accept_volume(tx: &mut WriteTx<'_>, volume_id: &str) -> Result<()> {
    let volume = tx.get_mut::<VolumeEntry>(volume_id)?;
    volume.pending = None;
    let volume = volume.clone();
    for id in &volume.bricks {
        tx.get_mut::<BrickEntry>(id)?.pending = None;
    }
    let cluster = tx.get_mut::<ClusterEntry>(&volume.cluster_id)?;
    if !cluster.volumes.contains(&volume.id) {
        cluster.volumes.push(volume.id.clone());
    }
    Ok(())
}

// =============================================================================
// Volume create
// =============================================================================

pub struct VolumeCreateOperation {
    core: OpCore,
    volume: VolumeEntry,
    /// Devices that failed brick creation on an earlier attempt
    exclude_devices: Vec<String>,
    reclaimed: BTreeMap<String, bool>,
}

impl VolumeCreateOperation {
    pub fn new(ctx: OperationContext, volume: VolumeEntry) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::VolumeCreate),
            volume,
            exclude_devices: Vec::new(),
            reclaimed: BTreeMap::new(),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let id = required_action(&entry, ChangeType::AddVolume)?;
        let volume = ctx.store.view(|tx| tx.get(&id))?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            volume,
            exclude_devices: Vec::new(),
            reclaimed: BTreeMap::new(),
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume.id
    }
}

#[async_trait]
impl Operation for VolumeCreateOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Create volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::VolumeCreate
    }

    fn max_retries(&self) -> usize {
        2
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, volume = %self.volume.name))]
    fn build(&mut self) -> Result<()> {
        self.core.reset();
        let mut entry = self.core.entry.clone();
        let mut volume = self.volume.clone();
        volume.bricks.clear();
        let ctx = &self.core.ctx;
        let exclude = &self.exclude_devices;
        ctx.store.update(|tx| {
            build_volume(ctx, tx, &mut entry, &mut volume, exclude)?;
            tx.insert(entry.clone())
        })?;
        self.core.entry = entry;
        self.volume = volume;
        self.reclaimed.clear();
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, volume = %self.volume.name))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        create_volume(
            &self.core.ctx,
            commands,
            &self.volume,
            &mut self.exclude_devices,
        )
        .await
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            accept_volume(tx, &self.volume.id)?;
            self.core.delete(tx)
        })?;
        info!(volume = %self.volume.name, size = self.volume.size, "volume created");
        Ok(())
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        self.reclaimed = destroy_volume(&self.core.ctx, commands, &self.volume).await?;
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            if tx.contains::<VolumeEntry>(&self.volume.id) {
                remove_volume(tx, &self.volume.id, &self.reclaimed)?;
            }
            self.core.delete(tx)
        })
    }
}

// =============================================================================
// Volume expand
// =============================================================================

pub struct VolumeExpandOperation {
    core: OpCore,
    volume_id: String,
    /// GiB added
    delta: u64,
    new_bricks: Vec<String>,
    /// New bricks found in the volume by a clean pass
    kept: Vec<String>,
    reclaimed: BTreeMap<String, bool>,
}

impl VolumeExpandOperation {
    pub fn new(ctx: OperationContext, volume_id: &str, delta: u64) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::VolumeExpand),
            volume_id: volume_id.to_string(),
            delta,
            new_bricks: Vec::new(),
            kept: Vec::new(),
            reclaimed: BTreeMap::new(),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let action = entry
            .first_of(ChangeType::ExpandVolume)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("volume expand {} has no target", entry.id)))?;
        let new_bricks = entry
            .actions_of(ChangeType::AddBrick)
            .map(|a| a.id.clone())
            .collect();
        Ok(Self {
            core: OpCore::load(ctx, entry),
            volume_id: action.id,
            delta: action.delta.unwrap_or(0),
            new_bricks,
            kept: Vec::new(),
            reclaimed: BTreeMap::new(),
        })
    }

    fn volume(&self) -> Result<VolumeEntry> {
        self.core.ctx.store.view(|tx| tx.get(&self.volume_id))
    }

    fn finish(&self, kept: &[String]) -> Result<()> {
        let grown = if self.new_bricks.is_empty() {
            0
        } else {
            self.delta * kept.len() as u64 / self.new_bricks.len() as u64
        };
        self.core.ctx.store.update(|tx| {
            for id in &self.new_bricks {
                if kept.contains(id) {
                    tx.get_mut::<BrickEntry>(id)?.pending = None;
                } else if tx.contains::<BrickEntry>(id) {
                    free_brick(tx, id, self.reclaimed.get(id).copied().unwrap_or(false))?;
                }
            }
            let volume = tx.get_mut::<VolumeEntry>(&self.volume_id)?;
            volume.bricks.extend(kept.iter().cloned());
            volume.size += grown;
            if let Some(block) = volume.block_info.as_mut() {
                block.give_back(grown);
            }
            volume.pending = None;
            self.core.delete(tx)
        })?;
        info!(volume = %self.volume_id, grown, "volume expand finished");
        Ok(())
    }
}

#[async_trait]
impl Operation for VolumeExpandOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Expand volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::VolumeExpand
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, volume = %self.volume_id, delta = self.delta))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let ctx = &self.core.ctx;
        let (volume_id, delta) = (&self.volume_id, self.delta);
        let bricks = ctx.store.update(|tx| {
            let volume: VolumeEntry = tx.get(volume_id)?;
            if let Some(owner) = &volume.pending {
                return Err(Error::Conflict(format!(
                    "volume {} is pending on operation {}",
                    volume.name, owner
                )));
            }
            for id in &volume.bricks {
                if tx.find::<BrickEntry>(id).is_some_and(|b| b.pending.is_some()) {
                    return Err(Error::Conflict(format!(
                        "brick {} of volume {} has a pending operation",
                        id, volume.name
                    )));
                }
            }
            let bricks = allocate_bricks(ctx, tx, &mut entry, &volume, delta, &[])?;
            tx.get_mut::<VolumeEntry>(volume_id)?.pending = Some(entry.id.clone());
            entry.record_delta(ChangeType::ExpandVolume, volume_id, Some(delta));
            tx.insert(entry.clone())?;
            Ok(bricks)
        })?;
        self.core.entry = entry;
        self.new_bricks = bricks.into_iter().map(|b| b.id).collect();
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, volume = %self.volume_id))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        let volume = self.volume()?;
        let (existing, new) = self.core.ctx.store.view(|tx| {
            Ok((
                hosted_bricks(tx, &volume.bricks)?,
                hosted_bricks(tx, &self.new_bricks)?,
            ))
        })?;

        if let Some((_, err)) = create_bricks(commands, &new).await.into_iter().next() {
            return Err(err);
        }

        let request = VolumeRequest {
            name: volume.name.clone(),
            durability: volume.durability,
            bricks: new.iter().map(HostedBrick::gluster_name).collect(),
        };
        let request = &request;
        first_reachable(&manage_hosts(&existing), |host| {
            async move { commands.volume_expand(&host, request).await }.boxed()
        })
        .await
    }

    fn finalize(&mut self) -> Result<()> {
        let all = self.new_bricks.clone();
        self.finish(&all)
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    /// Keep new bricks the volume already uses, destroy the rest
    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        let volume = self.volume()?;
        let (existing, new) = self.core.ctx.store.view(|tx| {
            Ok((
                hosted_bricks(tx, &volume.bricks)?,
                hosted_bricks(tx, &self.new_bricks)?,
            ))
        })?;
        let name = volume.name.as_str();
        let info = first_reachable(&manage_hosts(&existing), |host| {
            async move { commands.volume_info(&host, name).await }.boxed()
        })
        .await?;

        let (kept, dropped): (Vec<HostedBrick>, Vec<HostedBrick>) = new
            .into_iter()
            .partition(|b| info.has_brick(&b.gluster_name()));
        self.reclaimed = destroy_bricks(commands, &dropped).await?;
        self.kept = kept.into_iter().map(|b| b.brick.id).collect();
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        let kept = std::mem::take(&mut self.kept);
        self.finish(&kept)
    }
}

// =============================================================================
// Volume delete
// =============================================================================

pub struct VolumeDeleteOperation {
    core: OpCore,
    volume_id: String,
    reclaimed: BTreeMap<String, bool>,
}

impl VolumeDeleteOperation {
    pub fn new(ctx: OperationContext, volume_id: &str) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::VolumeDelete),
            volume_id: volume_id.to_string(),
            reclaimed: BTreeMap::new(),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let volume_id = required_action(&entry, ChangeType::DeleteVolume)?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            volume_id,
            reclaimed: BTreeMap::new(),
        })
    }

    fn volume(&self) -> Result<VolumeEntry> {
        self.core.ctx.store.view(|tx| tx.get(&self.volume_id))
    }

    /// Give the volume back untouched
    fn restore(&self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            let volume = tx.get_mut::<VolumeEntry>(&self.volume_id)?;
            volume.pending = None;
            let bricks = volume.bricks.clone();
            for id in &bricks {
                tx.get_mut::<BrickEntry>(id)?.pending = None;
            }
            self.core.delete(tx)
        })
    }
}

#[async_trait]
impl Operation for VolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Delete volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::VolumeDelete
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, volume = %self.volume_id))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let volume_id = &self.volume_id;
        self.core.ctx.store.update(|tx| {
            let volume: VolumeEntry = tx.get(volume_id)?;
            if let Some(owner) = &volume.pending {
                return Err(Error::Conflict(format!(
                    "volume {} is pending on operation {}",
                    volume.name, owner
                )));
            }
            if let Some(block) = &volume.block_info {
                if !block.block_volumes.is_empty() {
                    return Err(Error::InvalidRequest(format!(
                        "volume {} still hosts {} block volumes",
                        volume.name,
                        block.block_volumes.len()
                    )));
                }
            }
            for id in &volume.bricks {
                let brick = tx.get_mut::<BrickEntry>(id)?;
                if brick.pending.is_some() {
                    return Err(Error::Conflict(format!(
                        "brick {} of volume {} has a pending operation",
                        id, volume.name
                    )));
                }
                brick.pending = Some(entry.id.clone());
                entry.record(ChangeType::DeleteBrick, id);
            }
            tx.get_mut::<VolumeEntry>(volume_id)?.pending = Some(entry.id.clone());
            entry.record(ChangeType::DeleteVolume, volume_id);
            tx.insert(entry.clone())
        })?;
        self.core.entry = entry;
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, volume = %self.volume_id))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        let volume = self.volume()?;
        self.reclaimed = destroy_volume(&self.core.ctx, commands, &volume).await?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            remove_volume(tx, &self.volume_id, &self.reclaimed)?;
            self.core.delete(tx)
        })?;
        info!(volume = %self.volume_id, "volume deleted");
        Ok(())
    }

    /// A volume that is still known remotely is kept; one that is already
    /// gone is deleted the rest of the way
    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        let volume = self.volume()?;
        let bricks = self
            .core
            .ctx
            .store
            .view(|tx| hosted_bricks(tx, &volume.bricks))?;
        let name = volume.name.as_str();
        let info = first_reachable(&manage_hosts(&bricks), |host| {
            async move { commands.volume_info(&host, name).await }.boxed()
        })
        .await;
        match info {
            Ok(_) => self.restore(),
            Err(Error::VolumeDoesNotExist(_)) => {
                warn!(volume = %volume.name, "volume already gone, finishing delete");
                self.clean(commands).await?;
                self.clean_done()
            }
            Err(e) => Err(e),
        }
    }

    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        self.exec(commands).await
    }

    fn clean_done(&mut self) -> Result<()> {
        self.finalize()
    }
}
