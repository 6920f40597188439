use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    pub nodes: Vec<String>,
    pub volumes: Vec<String>,
    pub block_volumes: Vec<String>,
    /// Cluster accepts file volumes
    pub file: bool,
    /// Cluster accepts block volumes
    pub block: bool,
}

impl ClusterEntry {
    pub fn new() -> Self {
        Self {
            id: super::new_id(),
            nodes: Vec::new(),
            volumes: Vec::new(),
            block_volumes: Vec::new(),
            file: true,
            block: true,
        }
    }

    pub fn remove_volume(&mut self, id: &str) {
        self.volumes.retain(|v| v != id);
    }

    pub fn remove_block_volume(&mut self, id: &str) {
        self.block_volumes.retain(|v| v != id);
    }
}

impl Default for ClusterEntry {
    fn default() -> Self {
        Self::new()
    }
}
