use crate::capacity::BrickReservation;
use serde::{Deserialize, Serialize};

/// Root directory under which brick filesystems are mounted
pub const MOUNT_ROOT: &str = "/var/lib/brickyard/mounts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrickEntry {
    pub id: String,
    pub node_id: String,
    pub device_id: String,
    pub volume_id: String,
    /// Virtual size of the brick LV, KiB
    pub size: u64,
    /// Thin pool size, KiB
    pub tp_size: u64,
    /// Thin pool metadata size, KiB
    pub pool_metadata_size: u64,
    pub gid: Option<i64>,
    pub pending: Option<String>,
}

impl BrickEntry {
    pub fn new(
        volume_id: &str,
        node_id: &str,
        device_id: &str,
        reservation: BrickReservation,
        gid: Option<i64>,
    ) -> Self {
        Self {
            id: super::new_id(),
            node_id: node_id.to_string(),
            device_id: device_id.to_string(),
            volume_id: volume_id.to_string(),
            size: reservation.size,
            tp_size: reservation.tp_size,
            pool_metadata_size: reservation.pool_metadata_size,
            gid,
            pending: None,
        }
    }

    /// Space this brick charges to its device
    pub fn total_size(&self) -> u64 {
        self.tp_size + self.pool_metadata_size
    }

    pub fn vg_name(&self) -> String {
        format!("vg_{}", self.device_id)
    }

    pub fn tp_name(&self) -> String {
        format!("tp_{}", self.id)
    }

    pub fn lv_name(&self) -> String {
        format!("brick_{}", self.id)
    }

    /// `/dev/<vg>/<lv>`
    pub fn device_path(&self) -> String {
        format!("/dev/{}/{}", self.vg_name(), self.lv_name())
    }

    pub fn mount_dir(&self) -> String {
        format!("{}/{}/{}", MOUNT_ROOT, self.vg_name(), self.lv_name())
    }

    /// Directory exported to the volume manager
    pub fn path(&self) -> String {
        format!("{}/brick", self.mount_dir())
    }
}
