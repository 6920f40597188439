use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockVolumeEntry {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    pub hosting_volume_id: String,
    /// Nominal size, GiB
    pub size: u64,
    /// Smallest size every target host has applied, GiB
    pub usable_size: u64,
    /// Storage hostnames exporting the target
    pub hosts: Vec<String>,
    pub auth: bool,
    pub iqn: Option<String>,
    pub lun: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pending: Option<String>,
}

impl BlockVolumeEntry {
    pub fn new(cluster_id: &str, hosting_volume_id: &str, name: Option<&str>, size: u64) -> Self {
        let id = super::new_id();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("blockvol_{}", id));
        Self {
            id,
            name,
            cluster_id: cluster_id.to_string(),
            hosting_volume_id: hosting_volume_id.to_string(),
            size,
            usable_size: size,
            hosts: Vec::new(),
            auth: false,
            iqn: None,
            lun: None,
            username: None,
            password: None,
            pending: None,
        }
    }
}
