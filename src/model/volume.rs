use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Brick arrangement of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Durability {
    None,
    Replicate { replica: u32 },
    Disperse { data: u32, redundancy: u32 },
}

impl Durability {
    /// Bricks per set
    pub fn set_size(&self) -> usize {
        match *self {
            Durability::None => 1,
            Durability::Replicate { replica } => replica as usize,
            Durability::Disperse { data, redundancy } => (data + redundancy) as usize,
        }
    }

    /// Size of each brick, KiB, for a set holding `set_capacity` KiB of data
    pub fn brick_size(&self, set_capacity: u64) -> u64 {
        match *self {
            Durability::Disperse { data, .. } => set_capacity.div_ceil(data as u64),
            _ => set_capacity,
        }
    }

    /// Most brick sets passed to a single `volume create`/`add-brick`
    pub fn max_sets_per_command(&self) -> usize {
        match self {
            Durability::None => 15,
            Durability::Replicate { .. } => 5,
            Durability::Disperse { .. } => 1,
        }
    }

    /// Arguments for `gluster volume create`
    pub fn create_args(&self) -> String {
        match *self {
            Durability::None => String::new(),
            Durability::Replicate { replica } => format!("replica {}", replica),
            Durability::Disperse { data, redundancy } => {
                format!("disperse-data {} redundancy {}", data, redundancy)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Durability::Replicate { replica } if !(1..=3).contains(&replica) => Err(
                Error::InvalidRequest(format!("unsupported replica count {}", replica)),
            ),
            Durability::Disperse { data, redundancy } if data < 2 || redundancy < 1 => {
                Err(Error::InvalidRequest(format!(
                    "unsupported disperse layout {}+{}",
                    data, redundancy
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Block hosting accounting, GiB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHostingInfo {
    pub free_size: u64,
    pub reserved_size: u64,
    pub block_volumes: Vec<String>,
}

impl BlockHostingInfo {
    /// 2% of a hosting volume is kept back for filesystem overhead
    pub fn for_size(size_gb: u64) -> Self {
        let reserved_size = (size_gb * 2).div_ceil(100).max(1).min(size_gb);
        Self {
            free_size: size_gb - reserved_size,
            reserved_size,
            block_volumes: Vec::new(),
        }
    }

    pub fn reserve(&mut self, size_gb: u64) -> Result<()> {
        if self.free_size < size_gb {
            return Err(Error::NoSpace(format!(
                "block hosting volume has {} GiB free, {} GiB requested",
                self.free_size, size_gb
            )));
        }
        self.free_size -= size_gb;
        Ok(())
    }

    pub fn give_back(&mut self, size_gb: u64) {
        self.free_size += size_gb;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    /// GiB
    pub size: u64,
    pub durability: Durability,
    /// Ordered; consecutive runs of `durability.set_size()` form a set
    pub bricks: Vec<String>,
    pub gid: Option<i64>,
    pub block_info: Option<BlockHostingInfo>,
    pub pending: Option<String>,
}

impl VolumeEntry {
    pub fn new(
        cluster_id: &str,
        name: Option<&str>,
        size: u64,
        durability: Durability,
        gid: Option<i64>,
        block: bool,
    ) -> Self {
        let id = super::new_id();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("vol_{}", id));
        Self {
            id,
            name,
            cluster_id: cluster_id.to_string(),
            size,
            durability,
            bricks: Vec::new(),
            gid,
            block_info: block.then(|| BlockHostingInfo::for_size(size)),
            pending: None,
        }
    }

    pub fn is_block_hosting(&self) -> bool {
        self.block_info.is_some()
    }

    /// Replace a brick id keeping its position in the set layout
    pub fn replace_brick(&mut self, old: &str, new: &str) -> bool {
        match self.bricks.iter().position(|b| b == old) {
            Some(idx) => {
                self.bricks[idx] = new.to_string();
                true
            }
            None => false,
        }
    }

    /// Ids of the other bricks in the same set as `brick_id`
    pub fn set_peers(&self, brick_id: &str) -> Vec<String> {
        let set = self.durability.set_size();
        match self.bricks.iter().position(|b| b == brick_id) {
            Some(idx) => {
                let start = idx - idx % set;
                self.bricks[start..(start + set).min(self.bricks.len())]
                    .iter()
                    .filter(|b| *b != brick_id)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }
}
