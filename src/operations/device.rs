//! Device add and remove
//!
//! Removing a device with bricks evicts them one at a time through child
//! [`BrickEvictOperation`]s. The child links itself to the parent record
//! while building, so a crash leaves a parent naming its live child.

use super::{
    load_operation, required_action, rollback_via_clean, BrickEvictOperation, OpCore, Operation,
    OperationContext,
};
use crate::capacity::StorageSize;
use crate::error::{Error, Result};
use crate::executor::commands::{DeviceInfo, StorageCommands};
use crate::model::{
    BrickEntry, ChangeType, DeviceEntry, EntityState, NodeEntry, OperationKind,
    PendingOperationEntry, PendingStatus,
};
use crate::store::TxRead;
use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

// =============================================================================
// Device add
// =============================================================================

pub struct DeviceAddOperation {
    core: OpCore,
    device: DeviceEntry,
    info: Option<DeviceInfo>,
}

impl DeviceAddOperation {
    pub fn new(ctx: OperationContext, node_id: &str, name: &str) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::DeviceAdd),
            device: DeviceEntry::new(node_id, name),
            info: None,
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let id = required_action(&entry, ChangeType::AddDevice)?;
        let device = ctx.store.view(|tx| tx.get(&id))?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            device,
            info: None,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    fn host(&self) -> Result<String> {
        let node: NodeEntry = self.core.ctx.store.view(|tx| tx.get(&self.device.node_id))?;
        Ok(node.manage_hostname)
    }
}

#[async_trait]
impl Operation for DeviceAddOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Add device"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::DeviceAdd
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, device = %self.device.name))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let mut device = self.device.clone();
        self.core.entry = self.core.ctx.store.update(|tx| {
            let node: NodeEntry = tx.get(&device.node_id)?;
            let taken = tx
                .list::<DeviceEntry>()
                .iter()
                .any(|d| d.node_id == node.id && d.name == device.name);
            if taken {
                return Err(Error::Conflict(format!(
                    "device {} already exists on node {}",
                    device.name, node.manage_hostname
                )));
            }
            device.pending = Some(entry.id.clone());
            entry.record(ChangeType::AddDevice, &device.id);
            tx.insert(device.clone())?;
            tx.insert(entry.clone())?;
            Ok(entry)
        })?;
        self.device = device;
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, device = %self.device.name))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        let host = self.host()?;
        let info = commands
            .device_setup(&host, &self.device.name, &self.device.vg_name())
            .await?;
        self.info = Some(info);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let info = self
            .info
            .ok_or_else(|| Error::Internal("device add finalized before exec".into()))?;
        let device_id = self.device.id.clone();
        self.core.ctx.store.update(|tx| {
            let device = tx.get_mut::<DeviceEntry>(&device_id)?;
            device.storage = StorageSize::new(info.size);
            device.pending = None;
            let node_id = device.node_id.clone();
            tx.get_mut::<NodeEntry>(&node_id)?.devices.push(device_id.clone());
            self.core.delete(tx)
        })?;
        info!(device = %self.device.name, size = info.size, "device added");
        Ok(())
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        rollback_via_clean(self, commands).await
    }

    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        let host = self.host()?;
        commands
            .device_teardown(&host, &self.device.name, &self.device.vg_name())
            .await
    }

    fn clean_done(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            if tx.contains::<DeviceEntry>(&self.device.id) {
                tx.delete::<DeviceEntry>(&self.device.id)?;
            }
            self.core.delete(tx)
        })
    }
}

// =============================================================================
// Device remove
// =============================================================================

pub struct DeviceRemoveOperation {
    core: OpCore,
    device_id: String,
    /// Device had no bricks and was failed during build; nothing recorded
    direct: bool,
}

impl DeviceRemoveOperation {
    pub fn new(ctx: OperationContext, device_id: &str) -> Self {
        Self {
            core: OpCore::new(ctx, OperationKind::DeviceRemove),
            device_id: device_id.to_string(),
            direct: false,
        }
    }

    pub fn load(ctx: OperationContext, entry: PendingOperationEntry) -> Result<Self> {
        let device_id = required_action(&entry, ChangeType::RemoveDevice)?;
        Ok(Self {
            core: OpCore::load(ctx, entry),
            device_id,
            direct: false,
        })
    }

    /// Next brick on the device that nobody else owns
    fn next_brick(&self, tried: &[String]) -> Result<Option<String>> {
        self.core.ctx.store.view(|tx| {
            let device: DeviceEntry = tx.get(&self.device_id)?;
            Ok(device
                .bricks
                .iter()
                .filter(|id| !tried.contains(id))
                .find(|id| tx.find::<BrickEntry>(id).is_some_and(|b| b.pending.is_none()))
                .cloned())
        })
    }

    fn mark_child_stale(&self, child_id: &str) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            tx.get_mut::<PendingOperationEntry>(child_id)?.status = PendingStatus::Stale;
            Ok(())
        })
    }

    /// Run one child eviction to completion or undo it
    async fn evict(&self, commands: &StorageCommands, brick_id: &str) -> Result<()> {
        let mut child = BrickEvictOperation::new(self.core.ctx.clone(), brick_id)
            .with_parent(&self.core.entry.id);
        child.build()?;

        match child.exec(commands).await {
            Ok(()) => child.finalize(),
            Err(err) => {
                warn!(child = child.id(), error = %err, "brick eviction failed, undoing");
                if let Err(rollback) = child.rollback(commands).await {
                    error!(child = child.id(), error = %rollback, "brick eviction undo failed");
                    // the parent's clean settles the child whatever its status
                    if let Err(mark) = self.mark_child_stale(child.id()) {
                        error!(
                            child = child.id(),
                            error = %mark,
                            "unable to mark brick eviction stale"
                        );
                    }
                    return Err(Error::Rollback {
                        original: Box::new(err),
                        rollback: Box::new(rollback),
                    });
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Operation for DeviceRemoveOperation {
    fn id(&self) -> &str {
        &self.core.entry.id
    }

    fn label(&self) -> &'static str {
        "Remove device"
    }

    fn kind(&self) -> OperationKind {
        OperationKind::DeviceRemove
    }

    #[instrument(skip(self), fields(op = %self.core.entry.id, device = %self.device_id))]
    fn build(&mut self) -> Result<()> {
        let mut entry = self.core.entry.clone();
        let device_id = &self.device_id;
        let direct = self.core.ctx.store.update(|tx| {
            let device: DeviceEntry = tx.get(device_id)?;
            if let Some(owner) = &device.pending {
                return Err(Error::Conflict(format!(
                    "device {} is pending on operation {}",
                    device_id, owner
                )));
            }
            if device.bricks.is_empty() {
                tx.get_mut::<DeviceEntry>(device_id)?.state = EntityState::Failed;
                return Ok(true);
            }
            for id in &device.bricks {
                if tx.find::<BrickEntry>(id).is_some_and(|b| b.pending.is_some()) {
                    return Err(Error::Conflict(format!(
                        "brick {} on device {} has a pending operation",
                        id, device_id
                    )));
                }
            }
            let busy = tx.list::<PendingOperationEntry>().iter().any(|op| {
                op.actions_of(ChangeType::RemoveDevice)
                    .any(|a| a.id == *device_id)
            });
            if busy {
                return Err(Error::Conflict(format!(
                    "device {} is already being removed",
                    device_id
                )));
            }

            tx.get_mut::<DeviceEntry>(device_id)?.state = EntityState::Offline;
            entry.record(ChangeType::RemoveDevice, device_id);
            tx.insert(entry.clone())?;
            Ok(false)
        })?;

        self.direct = direct;
        if direct {
            info!(device = %self.device_id, "device has no bricks, failed directly");
        } else {
            self.core.entry = entry;
        }
        Ok(())
    }

    #[instrument(skip(self, commands), fields(op = %self.core.entry.id, device = %self.device_id))]
    async fn exec(&mut self, commands: &StorageCommands) -> Result<()> {
        if self.direct {
            return Ok(());
        }
        let mut tried = Vec::new();
        while let Some(brick_id) = self.next_brick(&tried)? {
            self.evict(commands, &brick_id).await?;
            tried.push(brick_id);
        }

        let left = self
            .core
            .ctx
            .store
            .view(|tx| Ok(tx.get::<DeviceEntry>(&self.device_id)?.bricks.len()))?;
        if left > 0 {
            return Err(Error::Conflict(format!(
                "{} bricks on device {} could not be evicted",
                left, self.device_id
            )));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.direct {
            return Ok(());
        }
        self.core.ctx.store.update(|tx| {
            tx.get_mut::<DeviceEntry>(&self.device_id)?.state = EntityState::Failed;
            self.core.delete(tx)
        })?;
        info!(device = %self.device_id, "device removed");
        Ok(())
    }

    async fn rollback(&mut self, commands: &StorageCommands) -> Result<()> {
        if self.direct {
            return Ok(());
        }
        rollback_via_clean(self, commands).await
    }

    /// Settle a child eviction that is still recorded
    async fn clean(&mut self, commands: &StorageCommands) -> Result<()> {
        if !self.core.is_recorded()? {
            return Ok(());
        }
        self.core.refresh()?;
        let Some(child_id) = self.core.entry.child().map(str::to_string) else {
            return Ok(());
        };
        let child = self
            .core
            .ctx
            .store
            .view(|tx| Ok(tx.find::<PendingOperationEntry>(&child_id).cloned()))?;
        if let Some(entry) = child {
            let mut child = load_operation(self.core.ctx.clone(), entry)?;
            child.clean(commands).await?;
            child.clean_done()?;
        }
        Ok(())
    }

    fn clean_done(&mut self) -> Result<()> {
        self.core.ctx.store.update(|tx| {
            if tx.contains::<PendingOperationEntry>(&self.core.entry.id) {
                self.core.delete(tx)?;
            }
            Ok(())
        })?;
        warn!(device = %self.device_id, "device removal abandoned, device left offline");
        Ok(())
    }
}
