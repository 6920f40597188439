//! Brickyard - Pending Operation Engine for Clustered Brick Storage
//!
//! Runs multi-step storage changes (devices, bricks, replicated and
//! dispersed volumes, block volumes) against a cluster of storage hosts so
//! that a crash at any point leaves enough state behind to finish or undo
//! the change later.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Brickyard                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐        │
//! │  │  Operations  │───▶│   Manager    │───▶│   Executor   │        │
//! │  │ build / exec │    │ retry, undo  │    │  (hosts)     │        │
//! │  └──────┬───────┘    └──────┬───────┘    └──────────────┘        │
//! │         │                   │                                    │
//! │         ▼                   ▼                                    │
//! │  ┌──────────────┐    ┌──────────────┐                            │
//! │  │    Store     │◀───│   Cleaner    │                            │
//! │  │ + pending ops│    │ (background) │                            │
//! │  └──────────────┘    └──────────────┘                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`capacity`] - Device accounting and thin pool sizing
//! - [`cleaner`] - Periodic clean-up of stale operations
//! - [`config`] - Configuration file and defaults
//! - [`error`] - Error types
//! - [`executor`] - Remote command execution, simulated cluster, fault hooks
//! - [`manager`] - Operation lifecycle driver
//! - [`metrics`] - Prometheus metrics
//! - [`model`] - Persisted entities and pending operation records
//! - [`operations`] - The domain operations
//! - [`placement`] - Brick placement across nodes and devices
//! - [`store`] - Transactional entity store

pub mod capacity;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod operations;
pub mod placement;
pub mod store;

// Re-export commonly used types
pub use cleaner::Cleaner;
pub use config::Config;
pub use error::{Error, Result};
pub use executor::commands::StorageCommands;
pub use executor::{CommandExecutor, FakeCluster, InjectExecutor};
pub use manager::{CleanReport, OperationManager, PendingReport};
pub use metrics::Metrics;
pub use operations::{Operation, OperationContext};
pub use store::Store;
