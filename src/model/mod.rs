//! Cluster topology entities and pending-operation records
//!
//! Every entity that an operation can reserve carries a `pending` field
//! holding the id of the owning [`PendingOperationEntry`]. Entities with a
//! pending id are invisible to other operations until the owner finalizes or
//! rolls back.

mod block_volume;
mod brick;
mod cluster;
mod device;
mod node;
mod pending;
mod volume;

pub use block_volume::BlockVolumeEntry;
pub use brick::BrickEntry;
pub use cluster::ClusterEntry;
pub use device::DeviceEntry;
pub use node::NodeEntry;
pub use pending::{
    ActionKind, ChangeType, OperationKind, PendingAction, PendingOperationEntry,
    PendingOperationInfo, PendingStatus,
};
pub use volume::{BlockHostingInfo, Durability, VolumeEntry};

use serde::{Deserialize, Serialize};

/// Generate a new entity id: 32 lower-case hex characters
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Administrative state of nodes and devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityState {
    #[default]
    Online,
    Offline,
    Failed,
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityState::Online => write!(f, "online"),
            EntityState::Offline => write!(f, "offline"),
            EntityState::Failed => write!(f, "failed"),
        }
    }
}
