use super::EntityState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub cluster_id: String,
    /// Hostname commands are sent to
    pub manage_hostname: String,
    /// Hostname used in brick paths
    pub storage_hostname: String,
    pub zone: u32,
    pub state: EntityState,
    pub devices: Vec<String>,
}

impl NodeEntry {
    pub fn new(cluster_id: &str, hostname: &str, zone: u32) -> Self {
        Self {
            id: super::new_id(),
            cluster_id: cluster_id.to_string(),
            manage_hostname: hostname.to_string(),
            storage_hostname: hostname.to_string(),
            zone,
            state: EntityState::Online,
            devices: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == EntityState::Online
    }
}
