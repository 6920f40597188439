//! Capacity Ledger
//!
//! Device capacity is tracked in KiB as `total = free + used`. Counters are
//! only mutated inside a store write transaction, and every reservation is
//! checked with a strict `free > requested` so an allocation never leaves a
//! device at exactly zero free space.
//!
//! Bricks are thin provisioned: the space charged to a device is the thin
//! pool size (`brick size * snapshot factor`) plus the pool metadata volume.

use crate::error::{Error, Result};
use crate::model::DeviceEntry;
use serde::{Deserialize, Serialize};

/// KiB per MiB
pub const MIB: u64 = 1024;
/// KiB per GiB
pub const GIB: u64 = 1024 * MIB;

const POOL_METADATA_MIN: u64 = 2 * MIB;
const POOL_METADATA_MAX: u64 = 16 * GIB;

// =============================================================================
// Storage counters
// =============================================================================

/// Capacity counters of one device, in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSize {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

impl StorageSize {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            free: total,
            used: 0,
        }
    }

    /// Strict fit test
    pub fn check(&self, amount: u64) -> bool {
        self.free > amount
    }

    pub fn allocate(&mut self, amount: u64) -> Result<()> {
        if !self.check(amount) {
            return Err(Error::NoSpace(format!(
                "requested {} KiB, {} KiB free",
                amount, self.free
            )));
        }
        self.free -= amount;
        self.used += amount;
        Ok(())
    }

    pub fn release(&mut self, amount: u64) -> Result<()> {
        if amount > self.used {
            return Err(Error::Internal(format!(
                "releasing {} KiB but only {} KiB in use",
                amount, self.used
            )));
        }
        self.used -= amount;
        self.free += amount;
        Ok(())
    }

    /// Replace the total after the volume group is (re)inspected
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
        self.free = total.saturating_sub(self.used);
    }

    pub fn is_balanced(&self) -> bool {
        self.free + self.used == self.total
    }
}

// =============================================================================
// Thin pool sizing
// =============================================================================

/// The one place the snapshot headroom factor lives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinPoolSizing {
    snapshot_factor: f64,
}

/// Space charged to a device for one brick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickReservation {
    /// Virtual size of the brick LV
    pub size: u64,
    /// Thin pool size
    pub tp_size: u64,
    pub pool_metadata_size: u64,
}

impl BrickReservation {
    pub fn total(&self) -> u64 {
        self.tp_size + self.pool_metadata_size
    }
}

impl ThinPoolSizing {
    pub fn new(snapshot_factor: f64) -> Self {
        Self { snapshot_factor }
    }

    pub fn snapshot_factor(&self) -> f64 {
        self.snapshot_factor
    }

    pub fn thin_pool_size(&self, brick_size: u64) -> u64 {
        (brick_size as f64 * self.snapshot_factor).ceil() as u64
    }

    pub fn pool_metadata_size(&self, tp_size: u64) -> u64 {
        let size = (tp_size as f64 * 0.005).ceil() as u64;
        size.clamp(POOL_METADATA_MIN, POOL_METADATA_MAX)
    }

    pub fn reservation(&self, brick_size: u64) -> BrickReservation {
        let tp_size = self.thin_pool_size(brick_size);
        BrickReservation {
            size: brick_size,
            tp_size,
            pool_metadata_size: self.pool_metadata_size(tp_size),
        }
    }
}

impl Default for ThinPoolSizing {
    fn default() -> Self {
        Self::new(1.25)
    }
}

// =============================================================================
// Aggregates
// =============================================================================

/// Aggregate counters over a set of devices (node or cluster totals)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapacitySummary {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub devices: usize,
}

impl CapacitySummary {
    pub fn of<'a>(devices: impl IntoIterator<Item = &'a DeviceEntry>) -> Self {
        devices
            .into_iter()
            .fold(CapacitySummary::default(), |mut acc, d| {
                acc.total += d.storage.total;
                acc.free += d.storage.free;
                acc.used += d.storage.used;
                acc.devices += 1;
                acc
            })
    }

    pub fn is_balanced(&self) -> bool {
        self.free + self.used == self.total
    }
}
