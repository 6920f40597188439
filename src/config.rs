//! Configuration for the Brickyard engine
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! no file at all) is valid. Command line flags override selected values in
//! `main.rs`.

use crate::error::{Error, Result};
use crate::executor::inject::InjectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub operations: OperationsConfig,
    pub cleaner: CleanerConfig,
    pub inject: InjectConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("unable to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("unable to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.operations.snapshot_factor < 1.0 || self.operations.snapshot_factor > 100.0 {
            return Err(Error::Config(format!(
                "snapshot_factor must be within [1, 100], got {}",
                self.operations.snapshot_factor
            )));
        }
        if self.operations.max_inflight == 0 {
            return Err(Error::Config("max_inflight must be at least 1".into()));
        }
        if self.cleaner.interval_s == 0 {
            return Err(Error::Config("cleaner interval_s must be at least 1".into()));
        }
        if self.executor.gluster_cli_timeout == 0 {
            return Err(Error::Config("gluster_cli_timeout must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file backing the store; in-memory only when unset
    pub path: Option<PathBuf>,

    /// How long a write transaction waits for the lock
    pub lock_timeout_ms: u64,
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout_ms: 5_000,
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run commands through the local shell
    Local,
    /// In-memory simulated cluster
    Fake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,

    /// fstab file edited when mounting bricks
    pub fstab: String,

    /// Pass `--autobackup` to lvm commands
    pub backup_lvm_metadata: bool,

    /// Command prefixed to every lvm invocation
    pub lvm_wrapper: String,

    /// Timeout passed to the gluster CLI, seconds
    pub gluster_cli_timeout: u32,

    /// Batch timeout for remote commands, minutes
    pub timeout_minutes: u64,

    /// `gluster-block create` prealloc setting
    pub block_prealloc: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Local,
            fstab: "/etc/fstab".to_string(),
            backup_lvm_metadata: true,
            lvm_wrapper: String::new(),
            gluster_cli_timeout: 600,
            timeout_minutes: 10,
            block_prealloc: "full".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// In-flight operations allowed at once
    pub max_inflight: usize,

    /// Build attempts after a store transaction conflict
    pub build_retries: u32,

    /// First backoff between build attempts, doubled each time
    pub build_retry_backoff_ms: u64,

    /// Thin pool headroom multiplier applied to every brick
    pub snapshot_factor: f64,

    /// Smallest brick the placer will create, GiB
    pub brick_min_size_gb: u64,

    /// Largest brick the placer will create, GiB
    pub brick_max_size_gb: u64,

    /// Size of block hosting volumes created on demand, GiB
    pub block_hosting_volume_size_gb: u64,

    /// Create a block hosting volume when none has room
    pub auto_create_block_hosting_volume: bool,

    /// Start serving even if stale operations exist
    pub ignore_stale_operations: bool,
}

impl OperationsConfig {
    pub fn build_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.build_retry_backoff_ms)
    }
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            max_inflight: 64,
            build_retries: 5,
            build_retry_backoff_ms: 50,
            snapshot_factor: 1.25,
            brick_min_size_gb: 1,
            brick_max_size_gb: 4096,
            block_hosting_volume_size_gb: 100,
            auto_create_block_hosting_volume: true,
            ignore_stale_operations: false,
        }
    }
}

// =============================================================================
// Cleaner
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub enabled: bool,

    /// Delay before the first pass, seconds
    pub start_delay_s: u64,

    /// Time between passes, seconds
    pub interval_s: u64,

    /// Random extra delay added to each tick, up to this many seconds
    pub jitter_s: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay_s: 30,
            interval_s: 3600,
            jitter_s: 60,
        }
    }
}
