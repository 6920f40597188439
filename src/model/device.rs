use super::EntityState;
use crate::capacity::StorageSize;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub node_id: String,
    /// Block device path on the node, e.g. `/dev/sdb`
    pub name: String,
    pub storage: StorageSize,
    pub state: EntityState,
    pub bricks: Vec<String>,
    pub pending: Option<String>,
}

impl DeviceEntry {
    pub fn new(node_id: &str, name: &str) -> Self {
        Self {
            id: super::new_id(),
            node_id: node_id.to_string(),
            name: name.to_string(),
            storage: StorageSize::default(),
            state: EntityState::Online,
            bricks: Vec::new(),
            pending: None,
        }
    }

    /// Name of the volume group backing this device
    pub fn vg_name(&self) -> String {
        format!("vg_{}", self.id)
    }

    /// Device can take new bricks
    pub fn is_usable(&self) -> bool {
        self.state == EntityState::Online && self.pending.is_none()
    }

    pub fn storage_check(&self, amount: u64) -> bool {
        self.storage.check(amount)
    }

    pub fn storage_allocate(&mut self, amount: u64) -> Result<()> {
        self.storage.allocate(amount)
    }

    pub fn storage_free(&mut self, amount: u64) -> Result<()> {
        self.storage.release(amount)
    }

    pub fn add_brick(&mut self, brick_id: &str) {
        if !self.bricks.iter().any(|b| b == brick_id) {
            self.bricks.push(brick_id.to_string());
        }
    }

    pub fn remove_brick(&mut self, brick_id: &str) {
        self.bricks.retain(|b| b != brick_id);
    }
}
