//! Brick eviction
//!
//! Moves one brick of a replicated or dispersed volume to another device.
//!
//! ```text
//!   build      old brick pending, record DeleteBrick
//!   exec  I    volume info through a peer host
//!         II   separate transaction: place + allocate the new brick,
//!              record AddBrick
//!         III  create new brick ─▶ replace-brick ─▶ destroy old brick
//!   clean      volume info decides:
//!                new brick in the volume  ─▶ destroy old, accept
//!                new brick absent         ─▶ destroy new, revert
//!                no new brick recorded    ─▶ never started
//! ```

use super::{
    allocate_brick, candidates, hosted_bricks, hosts::first_reachable, manage_hosts,
    required_action, rollback_via_clean, HostedBrick, OpCore, Operation, OperationContext,
};
use crate::error::{Error, Result};
use crate::executor::commands::{StorageCommands, VolumeInfo};
use crate::capacity::BrickReservation;
use crate::model::{BrickEntry, ChangeType, OperationKind, PendingOperationEntry, VolumeEntry};
use crate::placement::PlacementRequest;
use crate::store::TxRead;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument, warn};

/// Outcome of a clean pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    NeverStarted,
    Accept,
    Revert,
}

pub struct BrickEvictOperation {
    core: OpCore,
    brick_id: String,
    parent: Option<String>,
    /// Brick id -> thin pool reclaimed, filled by destroys
    reclaimed: BTreeMap<String, bool>,
    resolution: Option<Resolution>,
}

impl BrickEvictOperation {
    pub fn new(ctx: OperationContext, brick_id: &str) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::BrickEvict),
            brick_id: brick_id.to_string(),
            parent: None,
            reclaimed: BTreeMap::new(),
            resolution: None,
        }
    }

    /// Evict on behalf of another operation, which records this one as its
    /// child while building
    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent = Some(parent_id.to_string());
        self
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let brick_id = required_action(&entry, ChangeType::DeleteBrick)?;
        let parent = entry.parent().map(str::to_string);
        Ok(Self {
            core: OpCore::load(ctx, entry),
            brick_id,
            parent,
            reclaimed: BTreeMap::new(),
            resolution: None,
        })
    }

    fn new_brick_id(&self) -> Option<String> {
        self.core
            .entry
            .first_of(ChangeType::AddBrick)
            .map(|a| a.id.clone())
    }

    /// Volume, the old brick and its set peers, all with hosts
    fn layout(&self) -> Result<(VolumeEntry, HostedBrick, Vec<HostedBrick>)> {
        self.core.ctx.store.view(|tx| {
            let brick: BrickEntry = tx.get(&self.brick_id)?;
            let volume: VolumeEntry = tx.get(&brick.volume_id)?;
            let old = hosted_bricks(tx, [&brick.id])?.remove(0);
            let peers = hosted_bricks(tx, &volume.set_peers(&brick.id))?;
            Ok((volume, old, peers))
        })
    }

    async fn volume_info(
        &self,
        commands: &StorageCommands,
        volume: &VolumeEntry,
        peers: &[HostedBrick],
    ) -> Result<VolumeInfo> {
        let name = volume.name.as_str();
        first_reachable(&manage_hosts(peers), |host| {
            async move { commands.volume_info(&host, name).await }.boxed()
        })
        .await
    }

    /// Destroy a brick and note whether its space came back. A brick on a
    /// host that cannot be reached stays charged to its device.
    async fn destroy(&mut self, commands: &StorageCommands, brick: &HostedBrick) -> Result<()> {
        let reclaimed = match commands.brick_destroy(&brick.manage_host, &brick.brick).await {
            Ok(reclaimed) => reclaimed,
            Err(e @ Error::Unreachable { .. }) => {
                warn!(
                    brick = %brick.brick.id,
                    error = %e,
                    "brick host unreachable, leaving brick behind"
                );
                false
            }
            Err(e) => return Err(e),
        };
        self.reclaimed.insert(brick.brick.id.clone(), reclaimed);
        Ok(())
    }

    /// Phase II: place the replacement in its own transaction so a crash
    /// after this point leaves a record naming it
    fn allocate_replacement(
        &mut self,
        volume: &VolumeEntry,
        old: &HostedBrick,
        peers: &[HostedBrick],
    ) -> Result<BrickEntry> {
        let ctx = self.core.ctx.clone();
        let op_id = self.core.entry.id.clone();
        let (entry, brick) = ctx.store.update(|tx| {
            let mut entry: PendingOperationEntry = tx.get(&op_id)?;
            if entry.first_of(ChangeType::AddBrick).is_some() {
                return Err(Error::Internal(format!(
                    "brick evict {} already has a replacement brick",
                    op_id
                )));
            }
            let reservation = BrickReservation {
                size: old.brick.size,
                tp_size: old.brick.tp_size,
                pool_metadata_size: old.brick.pool_metadata_size,
            };
            let request = PlacementRequest {
                sets: 1,
                set_size: 1,
                reservation: reservation.total(),
                exclude_nodes: peers.iter().map(|p| p.brick.node_id.clone()).collect(),
                exclude_devices: vec![old.brick.device_id.clone()],
            };
            let placement = ctx
                .placer
                .place(&candidates(&*tx, &volume.cluster_id)?, &request)?
                .into_iter()
                .flatten()
                .next()
                .ok_or_else(|| Error::NoSpace("no device for the replacement brick".into()))?;
            let brick = allocate_brick(
                tx,
                &mut entry,
                volume,
                &placement.node_id,
                &placement.device_id,
                reservation,
            )?;
            tx.put(entry.clone());
            Ok((entry, brick))
        })?;
        self.core.entry = entry;
        Ok(brick)
    }

    fn finish_never_started(&self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            if let Ok(brick) = tx.get_mut::<BrickEntry>(&self.brick_id) {
                brick.pending = None;
            }
            self.core.delete(tx)
        })
    }

    fn finish_accept(&self) -> Result<()> {
        let new_id = required_action(&self.core.entry, ChangeType::AddBrick)?;
        let reclaimed = self.reclaimed.get(&self.brick_id).copied().unwrap_or(false);
        self.core.ctx.store.update(|tx| {
            let old: BrickEntry = tx.get(&self.brick_id)?;
            super::free_brick(tx, &self.brick_id, reclaimed)?;
            let volume = tx.get_mut::<VolumeEntry>(&old.volume_id)?;
            if !volume.replace_brick(&self.brick_id, &new_id) {
                volume.bricks.push(new_id.clone());
            }
            tx.get_mut::<BrickEntry>(&new_id)?.pending = None;
            self.core.delete(tx)
        })?;
        info!(old = %self.brick_id, new = %new_id, "brick evicted");
        Ok(())
    }

    fn finish_revert(&self) -> Result<()> {
        let new_id = required_action(&self.core.entry, ChangeType::AddBrick)?;
        let reclaimed = self.reclaimed.get(&new_id).copied().unwrap_or(false);
        self.core.ctx.store.update(|tx| {
            if tx.contains::<BrickEntry>(&new_id) {
                super::free_brick(tx, &new_id, reclaimed)?;
            }
            if let Ok(brick) = tx.get_mut::<BrickEntry>(&self.brick_id) {
                brick.pending = None;
            }
            self.core.delete(tx)
        })?;
        info!(brick = %self.brick_id, "brick eviction reverted");
        Ok(())
    }
}

#[async_trait]
impl Operation for BrickEvictOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Evict brick"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::BrickEvict
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, brick = %self.brick_id))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let brick_id = &self.brick_id;
        let parent = self.parent.as_deref();
        self.core.entry = self.core.ctx.store.update(|tx| {
            let brick: BrickEntry = tx.get(brick_id)?;
            if let Some(owner) = &brick.pending {
                return Err(Error::Conflict(format!(
                    "brick {} is pending on operation {}",
                    brick_id, owner
                )));
            }
            let volume: VolumeEntry = tx.get(&brick.volume_id)?;
            if volume.durability.set_size() < 2 {
                return Err(Error::InvalidRequest(format!(
                    "volume {} has no redundancy, brick {} cannot be replaced",
                    volume.name, brick_id
                )));
            }
            if volume.pending.is_some() {
                return Err(Error::Conflict(format!(
                    "volume {} has a pending operation",
                    volume.name
                )));
            }
            for id in &volume.bricks {
                if tx.find::<BrickEntry>(id).is_some_and(|b| b.pending.is_some()) {
                    return Err(Error::Conflict(format!(
                        "volume {} has pending brick {}",
                        volume.name, id
                    )));
                }
            }

            entry.record(ChangeType::DeleteBrick, brick_id);
            if let Some(parent) = parent {
                entry.record(ChangeType::ParentOperation, parent);
                tx.get_mut::<PendingOperationEntry>(parent)?
                    .set_child(&entry.id);
            }
            tx.get_mut::<BrickEntry>(brick_id)?.pending = Some(entry.id.clone());
            tx.insert(entry.clone())?;
            Ok(entry)
        })?;
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, brick = %self.brick_id))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        // Phase I
        let (volume, old, peers) = self.layout()?;
        let info = self.volume_info(commands, &volume, &peers).await?;
        if !info.has_brick(&old.gluster_name()) {
            return Err(Error::Internal(format!(
                "brick {} is not part of volume {}",
                old.gluster_name(),
                volume.name
            )));
        }

        // Phase II
        let new = self.allocate_replacement(&volume, &old, &peers)?;
        let new = self
            .core
            .ctx
            .store
            .view(|tx| hosted_bricks(tx, [&new.id]))?
            .remove(0);

        // Phase III
        commands.brick_create(&new.manage_host, &new.brick).await?;
        commands
            .volume_replace_brick(
                &new.manage_host,
                &volume.name,
                &old.gluster_name(),
                &new.gluster_name(),
            )
            .await?;
        self.destroy(commands, &old).await
    }

    fn finalize(&mut self) -> Result<()> {
        self.finish_accept()
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, brick = %self.brick_id))]
    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        self.core.refresh()?;
        let Some(new_id) = self.new_brick_id() else {
            self.resolution = Some(Resolution::NeverStarted);
            return Ok(());
        };

        let (volume, old, peers) = self.layout()?;
        let new = self
            .core
            .ctx
            .store
            .view(|tx| hosted_bricks(tx, [&new_id]))?
            .remove(0);
        let known: BTreeSet<String> = self
            .core
            .ctx
            .store
            .view(|tx| hosted_bricks(tx, &volume.bricks))?
            .iter()
            .map(HostedBrick::gluster_name)
            .collect();

        let info = self.volume_info(commands, &volume, &peers).await?;
        let mut complete = false;
        for name in &info.bricks {
            if *name == new.gluster_name() {
                complete = true;
            } else if !known.contains(name) {
                return Err(Error::Internal(format!(
                    "volume {} reports unknown brick {}",
                    volume.name, name
                )));
            }
        }

        if complete {
            self.destroy(commands, &old).await?;
            self.resolution = Some(Resolution::Accept);
        } else {
            self.destroy(commands, &new).await?;
            self.resolution = Some(Resolution::Revert);
        }
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        match self.resolution {
            Some(Resolution::NeverStarted) => self.finish_never_started(),
            Some(Resolution::Accept) => self.finish_accept(),
            Some(Resolution::Revert) => self.finish_revert(),
            None => Err(Error::Internal(format!(
                "brick evict {} finished cleaning without a clean pass",
                self.core.entry.id
            ))),
        }
    }
}
