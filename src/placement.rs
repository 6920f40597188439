//! Brick placement
//!
//! Operations ask a [`Placer`] where new bricks should go and only record the
//! answer. The placer sees a snapshot of usable devices and returns one
//! `Vec<BrickPlacement>` per brick set.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// A device that may receive a brick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: String,
    pub device_id: String,
    pub zone: u32,
    /// Free KiB on the device
    pub free: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub sets: usize,
    pub set_size: usize,
    /// KiB charged per brick
    pub reservation: u64,
    /// Nodes that must not receive any brick
    pub exclude_nodes: Vec<String>,
    /// Devices that must not receive any brick
    pub exclude_devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrickPlacement {
    pub node_id: String,
    pub device_id: String,
}

pub trait Placer: Send + Sync {
    fn place(
        &self,
        candidates: &[Candidate],
        request: &PlacementRequest,
    ) -> Result<Vec<Vec<BrickPlacement>>>;
}

/// Most-free-device-first placement with one brick per node per set
#[derive(Debug, Default, Clone)]
pub struct SimplePlacer;

impl Placer for SimplePlacer {
    fn place(
        &self,
        candidates: &[Candidate],
        request: &PlacementRequest,
    ) -> Result<Vec<Vec<BrickPlacement>>> {
        let mut remaining: HashMap<&str, u64> = candidates
            .iter()
            .map(|c| (c.device_id.as_str(), c.free))
            .collect();
        let mut sets = Vec::with_capacity(request.sets);

        for set_idx in 0..request.sets {
            let mut used_nodes: HashSet<&str> = HashSet::new();
            let mut set = Vec::with_capacity(request.set_size);

            for member in 0..request.set_size {
                let pick = candidates
                    .iter()
                    .filter(|c| !request.exclude_nodes.contains(&c.node_id))
                    .filter(|c| !request.exclude_devices.contains(&c.device_id))
                    .filter(|c| !used_nodes.contains(c.node_id.as_str()))
                    .filter(|c| remaining[c.device_id.as_str()] > request.reservation)
                    .max_by(|a, b| {
                        remaining[a.device_id.as_str()]
                            .cmp(&remaining[b.device_id.as_str()])
                            .then_with(|| b.device_id.cmp(&a.device_id))
                    })
                    .ok_or_else(|| {
                        Error::NoSpace(format!(
                            "no device with more than {} KiB free for brick {} of set {}",
                            request.reservation, member, set_idx
                        ))
                    })?;

                if let Some(free) = remaining.get_mut(pick.device_id.as_str()) {
                    *free -= request.reservation;
                }
                used_nodes.insert(pick.node_id.as_str());
                set.push(BrickPlacement {
                    node_id: pick.node_id.clone(),
                    device_id: pick.device_id.clone(),
                });
            }
            sets.push(set);
        }
        Ok(sets)
    }
}
