//! Pending operation records
//!
//! ```text
//!   build ──▶ New ──▶ InProgress ──▶ finalize ──▶ (deleted)
//!                          │
//!                          ├──▶ rollback ok ──▶ (deleted)
//!                          └──▶ rollback failed / crash ──▶ Stale ──▶ clean ok ──▶ (deleted)
//!                                                             ▲            │
//!                                                             └─ clean failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which domain operation owns a pending record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    DeviceAdd,
    DeviceRemove,
    BrickEvict,
    VolumeCreate,
    VolumeExpand,
    VolumeDelete,
    BlockVolumeCreate,
    BlockVolumeExpand,
    BlockVolumeDelete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::DeviceAdd => "device_add",
            OperationKind::DeviceRemove => "device_remove",
            OperationKind::BrickEvict => "brick_evict",
            OperationKind::VolumeCreate => "volume_create",
            OperationKind::VolumeExpand => "volume_expand",
            OperationKind::VolumeDelete => "volume_delete",
            OperationKind::BlockVolumeCreate => "block_volume_create",
            OperationKind::BlockVolumeExpand => "block_volume_expand",
            OperationKind::BlockVolumeDelete => "block_volume_delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingStatus {
    /// Built, exec not started
    New,
    /// Exec running
    InProgress,
    /// Left behind by a crash or a failed rollback
    Stale,
    /// Exec failed in a way the operation marked for cleanup
    Failed,
}

impl PendingStatus {
    pub fn is_cleanable(&self) -> bool {
        matches!(self, PendingStatus::Stale | PendingStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::New => "new",
            PendingStatus::InProgress => "in_progress",
            PendingStatus::Stale => "stale",
            PendingStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic undo class of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Entity was created; delete it on rollback
    Add,
    /// Entity existed; restore it on rollback, remove it on commit
    Delete,
    /// Operation specific side effect
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    AddBrick,
    DeleteBrick,
    AddVolume,
    DeleteVolume,
    ExpandVolume,
    AddBlockVolume,
    DeleteBlockVolume,
    ExpandBlockVolume,
    AddDevice,
    RemoveDevice,
    ChildOperation,
    ParentOperation,
}

impl ChangeType {
    pub fn action_kind(&self) -> ActionKind {
        match self {
            ChangeType::AddBrick
            | ChangeType::AddVolume
            | ChangeType::AddBlockVolume
            | ChangeType::AddDevice => ActionKind::Add,
            ChangeType::DeleteBrick | ChangeType::DeleteVolume | ChangeType::DeleteBlockVolume => {
                ActionKind::Delete
            }
            ChangeType::ExpandVolume
            | ChangeType::ExpandBlockVolume
            | ChangeType::RemoveDevice
            | ChangeType::ChildOperation
            | ChangeType::ParentOperation => ActionKind::Marker,
        }
    }

    /// Entity table the action id refers to
    pub fn entity_kind(&self) -> &'static str {
        match self {
            ChangeType::AddBrick | ChangeType::DeleteBrick => "brick",
            ChangeType::AddVolume | ChangeType::DeleteVolume | ChangeType::ExpandVolume => "volume",
            ChangeType::AddBlockVolume
            | ChangeType::DeleteBlockVolume
            | ChangeType::ExpandBlockVolume => "block_volume",
            ChangeType::AddDevice | ChangeType::RemoveDevice => "device",
            ChangeType::ChildOperation | ChangeType::ParentOperation => "pending_operation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub change: ChangeType,
    pub id: String,
    /// Change specific amount (new size for expands)
    pub delta: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperationEntry {
    pub id: String,
    pub kind: OperationKind,
    pub status: PendingStatus,
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<PendingAction>,
}

impl PendingOperationEntry {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: super::new_id(),
            kind,
            status: PendingStatus::New,
            timestamp: Utc::now(),
            actions: Vec::new(),
        }
    }

    pub fn record(&mut self, change: ChangeType, id: &str) {
        self.record_delta(change, id, None);
    }

    pub fn record_delta(&mut self, change: ChangeType, id: &str, delta: Option<u64>) {
        self.actions.push(PendingAction {
            change,
            id: id.to_string(),
            delta,
        });
    }

    pub fn actions_of(&self, change: ChangeType) -> impl Iterator<Item = &PendingAction> {
        self.actions.iter().filter(move |a| a.change == change)
    }

    pub fn first_of(&self, change: ChangeType) -> Option<&PendingAction> {
        self.actions_of(change).next()
    }

    pub fn child(&self) -> Option<&str> {
        self.first_of(ChangeType::ChildOperation)
            .map(|a| a.id.as_str())
    }

    pub fn parent(&self) -> Option<&str> {
        self.first_of(ChangeType::ParentOperation)
            .map(|a| a.id.as_str())
    }

    pub fn set_child(&mut self, child_id: &str) {
        self.clear_child();
        self.record(ChangeType::ChildOperation, child_id);
    }

    pub fn clear_child(&mut self) {
        self.actions
            .retain(|a| a.change != ChangeType::ChildOperation);
    }

    pub fn info(&self) -> PendingOperationInfo {
        PendingOperationInfo {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            timestamp: self.timestamp,
            actions: self.actions.clone(),
        }
    }
}

/// Read-only view handed to callers listing pending operations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperationInfo {
    pub id: String,
    pub kind: OperationKind,
    pub status: PendingStatus,
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<PendingAction>,
}
