//! Block volume create, expand and delete
//!
//! Block volumes live inside a block hosting volume and are charged against
//! its `free_size` in GiB. Create may build the hosting volume in the same
//! operation when none has room.
//!
//! Expand tolerates partial success: `gluster-block` may resize the target
//! on some hosts only. The clean pass records the nominal size it reports
//! and takes the usable size as the smallest size any host applied, so an
//! expand can be retried to the same size until every host agrees.

use super::{
    hosted_bricks, hosts::first_reachable, manage_hosts, required_action, rollback_via_clean,
    volume::{accept_volume, build_volume, create_volume, destroy_volume, remove_volume},
    OpCore, Operation, OperationContext,
};
use crate::error::{Error, Result};
use crate::executor::commands::{
    BlockVolumeCreated, BlockVolumeInfo, BlockVolumeRequest, StorageCommands,
};
use crate::model::{
    BlockHostingInfo, BlockVolumeEntry, ChangeType, ClusterEntry, Durability, OperationKind,
    PendingOperationEntry, VolumeEntry,
};
use crate::store::{TxRead, WriteTx};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// Hosting volume of a block volume with the hosts that can manage it
fn hosting(ctx: &OperationContext, hosting_volume_id: &str) -> Result<(VolumeEntry, Vec<String>)> {
    ctx.store.view(|tx| {
        let volume: VolumeEntry = tx.get(hosting_volume_id)?;
        let bricks = hosted_bricks(tx, &volume.bricks)?;
        Ok((volume, manage_hosts(&bricks)))
    })
}

fn hosting_info_mut<'t>(
    tx: &'t mut WriteTx<'_>,
    volume_id: &str,
) -> Result<&'t mut BlockHostingInfo> {
    tx.get_mut::<VolumeEntry>(volume_id)?
        .block_info
        .as_mut()
        .ok_or_else(|| {
            Error::Internal(format!("volume {} does not host block volumes", volume_id))
        })
}

// =============================================================================
// Block volume create
// =============================================================================

pub struct BlockVolumeCreateOperation {
    core: OpCore,
    block: BlockVolumeEntry,
    /// Hosting volume built by this operation
    new_hosting: Option<VolumeEntry>,
    created: Option<BlockVolumeCreated>,
    reclaimed: BTreeMap<String, bool>,
}

impl BlockVolumeCreateOperation {
    pub fn new(
        ctx: OperationContext,
        cluster_id: &str,
        name: Option<&str>,
        size: u64,
        auth: bool,
    ) -> Self {
        let mut block = BlockVolumeEntry::new(cluster_id, "", name, size);
        block.auth = auth;
        Self {
            core: OpCore::new(ctx, OperationKind::BlockVolumeCreate),
            block,
            new_hosting: None,
            created: None,
            reclaimed: BTreeMap::new(),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let block_id = required_action(&entry, ChangeType::AddBlockVolume)?;
        let hosting_id = entry.first_of(ChangeType::AddVolume).map(|a| a.id.clone());
        let (block, new_hosting) = ctx.store.view(|tx| {
            let block: BlockVolumeEntry = tx.get(&block_id)?;
            let hosting = match &hosting_id {
                Some(id) => Some(tx.get::<VolumeEntry>(id)?),
                None => None,
            };
            Ok((block, hosting))
        })?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            block,
            new_hosting,
            created: None,
            reclaimed: BTreeMap::new(),
        })
    }

    pub fn block_volume_id(&self) -> &str {
        &self.block.id
    }

    /// Existing hosting volume with room, reserved on success
    fn reserve_existing(&self, tx: &mut WriteTx<'_>) -> Result<Option<String>> {
        let size = self.block.size;
        let pick = tx
            .list::<VolumeEntry>()
            .into_iter()
            .filter(|v| v.cluster_id == self.block.cluster_id && v.pending.is_none())
            .filter_map(|v| v.block_info.as_ref().map(|b| (v.id.clone(), b.free_size)))
            .filter(|(_, free)| *free >= size)
            .max_by_key(|(_, free)| *free)
            .map(|(id, _)| id);
        if let Some(id) = &pick {
            hosting_info_mut(tx, id)?.reserve(size)?;
        }
        Ok(pick)
    }

    /// Hosting volume sized from configuration, placed in `tx`
    fn build_hosting(
        &self,
        tx: &mut WriteTx<'_>,
        entry: &mut PendingOperationEntry,
    ) -> Result<VolumeEntry> {
        let config = &self.core.ctx.config;
        if !config.auto_create_block_hosting_volume {
            return Err(Error::NoSpace(format!(
                "no block hosting volume has {} GiB free",
                self.block.size
            )));
        }
        let size = config.block_hosting_volume_size_gb;
        if BlockHostingInfo::for_size(size).free_size < self.block.size {
            return Err(Error::NoSpace(format!(
                "block volume of {} GiB does not fit a {} GiB block hosting volume",
                self.block.size, size
            )));
        }
        let mut volume = VolumeEntry::new(
            &self.block.cluster_id,
            None,
            size,
            Durability::Replicate { replica: 3 },
            None,
            true,
        );
        if let Some(info) = volume.block_info.as_mut() {
            info.reserve(self.block.size)?;
        }
        build_volume(&self.core.ctx, tx, entry, &mut volume, &[])?;
        info!(volume = %volume.name, size, "block hosting volume planned");
        Ok(volume)
    }
}

#[async_trait]
impl Operation for BlockVolumeCreateOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Create block volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::BlockVolumeCreate
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, block_volume = %self.block.name))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let mut block = self.block.clone();
        let (block, new_hosting) = self.core.ctx.store.update(|tx| {
            let cluster: ClusterEntry = tx.get(&block.cluster_id)?;
            if !cluster.block {
                return Err(Error::InvalidRequest(format!(
                    "cluster {} does not allow block volumes",
                    cluster.id
                )));
            }

            let (hosting_id, new_hosting) = match self.reserve_existing(tx)? {
                Some(id) => (id, None),
                None => {
                    let volume = self.build_hosting(tx, &mut entry)?;
                    (volume.id.clone(), Some(volume))
                }
            };

            let hosts = {
                let volume: VolumeEntry = tx.get(&hosting_id)?;
                let mut hosts: Vec<String> = Vec::new();
                for b in hosted_bricks(&*tx, &volume.bricks)? {
                    if !hosts.contains(&b.storage_host) {
                        hosts.push(b.storage_host);
                    }
                }
                hosts
            };

            block.hosting_volume_id = hosting_id;
            block.hosts = hosts;
            block.pending = Some(entry.id.clone());
            entry.record(ChangeType::AddBlockVolume, &block.id);
            tx.insert(block.clone())?;
            tx.insert(entry.clone())?;
            Ok((block, new_hosting))
        })?;
        self.core.entry = entry;
        self.block = block;
        self.new_hosting = new_hosting;
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, block_volume = %self.block.name))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        if let Some(volume) = &self.new_hosting {
            let mut failed_devices = Vec::new();
            create_volume(&self.core.ctx, commands, volume, &mut failed_devices).await?;
        }

        let (volume, hosts) = hosting(&self.core.ctx, &self.block.hosting_volume_id)?;
        let request = BlockVolumeRequest {
            hosting_volume: volume.name.clone(),
            name: self.block.name.clone(),
            size: self.block.size,
            hosts: self.block.hosts.clone(),
            auth: self.block.auth,
        };
        let request = &request;
        let created = first_reachable(&hosts, |host| {
            async move { commands.block_volume_create(&host, request).await }.boxed()
        })
        .await?;
        self.created = Some(created);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let created = self
            .created
            .clone()
            .ok_or_else(|| Error::Internal("block volume finalized before exec".into()))?;
        self.core.ctx.store.update(|tx| {
            let block = tx.get_mut::<BlockVolumeEntry>(&self.block.id)?;
            block.iqn = Some(created.iqn.clone());
            block.username = created.username.clone();
            block.password = created.password.clone();
            block.pending = None;

            if let Some(volume) = &self.new_hosting {
                accept_volume(tx, &volume.id)?;
            }
            hosting_info_mut(tx, &self.block.hosting_volume_id)?
                .block_volumes
                .push(self.block.id.clone());
            let cluster = tx.get_mut::<ClusterEntry>(&self.block.cluster_id)?;
            cluster.block_volumes.push(self.block.id.clone());
            self.core.delete(tx)
        })?;
        info!(block_volume = %self.block.name, size = self.block.size, "block volume created");
        Ok(())
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        if let Some(volume) = &self.new_hosting {
            // deleting the hosting volume takes the block volume with it
            self.reclaimed = destroy_volume(&self.core.ctx, commands, volume).await?;
            return Ok(());
        }

        let (volume, hosts) = hosting(&self.core.ctx, &self.block.hosting_volume_id)?;
        let hv = volume.name.as_str();
        let existing = first_reachable(&hosts, |host| {
            async move { commands.block_volume_list(&host, hv).await }.boxed()
        })
        .await?;
        if existing.contains(&self.block.name) {
            let name = self.block.name.as_str();
            first_reachable(&hosts, |host| {
                async move { commands.block_volume_delete(&host, hv, name).await }.boxed()
            })
            .await?;
        }
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            if tx.contains::<BlockVolumeEntry>(&self.block.id) {
                tx.delete::<BlockVolumeEntry>(&self.block.id)?;
            }
            match &self.new_hosting {
                Some(volume) if tx.contains::<VolumeEntry>(&volume.id) => {
                    remove_volume(tx, &volume.id, &self.reclaimed)?
                }
                Some(_) => {}
                None => {
                    hosting_info_mut(tx, &self.block.hosting_volume_id)?.give_back(self.block.size)
                }
            }
            self.core.delete(tx)
        })
    }
}

// =============================================================================
// Block volume expand
// =============================================================================

pub struct BlockVolumeExpandOperation {
    core: OpCore,
    block_id: String,
    /// Requested size, GiB
    new_size: u64,
    info: Option<BlockVolumeInfo>,
}

impl BlockVolumeExpandOperation {
    pub fn new(ctx: OperationContext, block_id: &str, new_size: u64) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::BlockVolumeExpand),
            block_id: block_id.to_string(),
            new_size,
            info: None,
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let action = entry
            .first_of(ChangeType::ExpandBlockVolume)
            .cloned()
            .ok_or_else(|| {
                Error::Internal(format!("block volume expand {} has no target", entry.id))
            })?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            block_id: action.id,
            new_size: action.delta.unwrap_or(0),
            info: None,
        })
    }

    fn block(&self) -> Result<BlockVolumeEntry> {
        self.core.ctx.store.view(|tx| tx.get(&self.block_id))
    }
}

#[async_trait]
impl Operation for BlockVolumeExpandOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Expand block volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::BlockVolumeExpand
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, block_volume = %self.block_id, new_size = self.new_size))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let (block_id, new_size) = (&self.block_id, self.new_size);
        self.core.ctx.store.update(|tx| {
            let block: BlockVolumeEntry = tx.get(block_id)?;
            if let Some(owner) = &block.pending {
                return Err(Error::Conflict(format!(
                    "block volume {} is pending on operation {}",
                    block.name, owner
                )));
            }
            let volume: VolumeEntry = tx.get(&block.hosting_volume_id)?;
            if volume.pending.is_some() {
                return Err(Error::Conflict(format!(
                    "block hosting volume {} has a pending operation",
                    volume.name
                )));
            }
            if new_size == block.size && block.usable_size == block.size {
                return Err(Error::InvalidRequest(format!(
                    "block volume {} is already {} GiB, nothing to be done",
                    block.name, new_size
                )));
            }
            if new_size < block.size {
                return Err(Error::InvalidRequest(format!(
                    "block volume {} cannot shrink from {} to {} GiB",
                    block.name, block.size, new_size
                )));
            }

            let required = new_size - block.size;
            if required > 0 {
                hosting_info_mut(tx, &block.hosting_volume_id)?.reserve(required)?;
            }
            tx.get_mut::<BlockVolumeEntry>(block_id)?.pending = Some(entry.id.clone());
            entry.record_delta(ChangeType::ExpandBlockVolume, block_id, Some(new_size));
            tx.insert(entry.clone())
        })?;
        self.core.entry = entry;
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, block_volume = %self.block_id))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        let block = self.block()?;
        let (volume, hosts) = hosting(&self.core.ctx, &block.hosting_volume_id)?;
        let (hv, name, size) = (volume.name.as_str(), block.name.as_str(), self.new_size);
        first_reachable(&hosts, |host| {
            async move { commands.block_volume_expand(&host, hv, name, size).await }.boxed()
        })
        .await
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            let block = tx.get_mut::<BlockVolumeEntry>(&self.block_id)?;
            block.size = self.new_size;
            block.usable_size = self.new_size;
            block.pending = None;
            self.core.delete(tx)
        })?;
        info!(block_volume = %self.block_id, size = self.new_size, "block volume expanded");
        Ok(())
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    /// Ask the block manager what size it ended up with
    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        let block = self.block()?;
        let (volume, hosts) = hosting(&self.core.ctx, &block.hosting_volume_id)?;
        let (hv, name) = (volume.name.as_str(), block.name.as_str());
        let info = first_reachable(&hosts, |host| {
            async move { commands.block_volume_info(&host, hv, name).await }.boxed()
        })
        .await?;
        self.info = Some(info);
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        let info = self
            .info
            .clone()
            .ok_or_else(|| Error::Internal("block volume expand cleaned without info".into()))?;
        self.core.ctx.store.update(|tx| {
            let block: BlockVolumeEntry = tx.get(&self.block_id)?;
            let reserved = self.new_size.saturating_sub(block.size);
            let unused = self.new_size.saturating_sub(info.size).min(reserved);
            if unused > 0 {
                hosting_info_mut(tx, &block.hosting_volume_id)?.give_back(unused);
            }
            let block = tx.get_mut::<BlockVolumeEntry>(&self.block_id)?;
            if info.size != self.new_size {
                warn!(
                    block_volume = %block.name,
                    requested = self.new_size,
                    reported = info.size,
                    "block volume size differs from the request"
                );
            }
            block.size = info.size.min(self.new_size).max(block.size);
            block.usable_size = info.usable_size.min(block.size);
            block.pending = None;
            self.core.delete(tx)
        })?;
        info!(
            block_volume = %self.block_id,
            size = info.size,
            usable = info.usable_size,
            "block volume expand settled"
        );
        Ok(())
    }
}

// =============================================================================
// Block volume delete
// =============================================================================

pub struct BlockVolumeDeleteOperation {
    core: OpCore,
    block_id: String,
}

impl BlockVolumeDeleteOperation {
    pub fn new(ctx: OperationContext, block_id: &str) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::BlockVolumeDelete),
            block_id: block_id.to_string(),
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let block_id = required_action(&entry, ChangeType::DeleteBlockVolume)?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            block_id,
        })
    }
}

#[async_trait]
impl Operation for BlockVolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Delete block volume"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::BlockVolumeDelete
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, block_volume = %self.block_id))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let block_id = &self.block_id;
        self.core.ctx.store.update(|tx| {
            let block = tx.get_mut::<BlockVolumeEntry>(block_id)?;
            if let Some(owner) = &block.pending {
                return Err(Error::Conflict(format!(
                    "block volume {} is pending on operation {}",
                    block.name, owner
                )));
            }
            block.pending = Some(entry.id.clone());
            entry.record(ChangeType::DeleteBlockVolume, block_id);
            tx.insert(entry.clone())
        })?;
        self.core.entry = entry;
        Ok(())
    }

    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        let block: BlockVolumeEntry = self.core.ctx.store.view(|tx| tx.get(&self.block_id))?;
        let (volume, hosts) = hosting(&self.core.ctx, &block.hosting_volume_id)?;
        let (hv, name) = (volume.name.as_str(), block.name.as_str());
        first_reachable(&hosts, |host| {
            async move { commands.block_volume_delete(&host, hv, name).await }.boxed()
        })
        .await
    }

    fn finalize(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            let block: BlockVolumeEntry = tx.delete(&self.block_id)?;
            let info = hosting_info_mut(tx, &block.hosting_volume_id)?;
            info.give_back(block.size);
            info.block_volumes.retain(|id| *id != block.id);
            if let Ok(cluster) = tx.get_mut::<ClusterEntry>(&block.cluster_id) {
                cluster.remove_block_volume(&block.id);
            }
            self.core.delete(tx)
        })?;
        info!(block_volume = %self.block_id, "block volume deleted");
        Ok(())
    }

    async fn rollback(&mut self, _commands: &StorageCommands) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            tx.get_mut::<BlockVolumeEntry>(&self.block_id)?.pending = None;
            self.core.delete(tx)
        })
    }

    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        self.exec(commands).await
    }

    fn clean_done(&mut self) -> Result<()> {
        self.finalize()
    }
}
