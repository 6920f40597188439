//! Entity Store
//!
//! Transactional store of every topology entity plus the pending operation
//! records. Readers share the lock; a writer works on a private copy of the
//! tables and swaps it in on success, so a closure returning `Err` leaves no
//! trace. When a backing file is configured the committed tables are written
//! to it before the swap.
//!
//! ```text
//!   view(|tx| ...)    ── read lock ──▶ &Tables
//!   update(|tx| ...)  ── write lock (bounded wait) ──▶ clone ──▶ closure
//!                                                        │ Ok  ──▶ persist ──▶ swap
//!                                                        │ Err ──▶ discard
//! ```
//!
//! Transactions must not be nested: an `update` issued from inside another
//! transaction on the same store times out with [`Error::TxConflict`].

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    BlockVolumeEntry, BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, PendingOperationEntry,
    VolumeEntry,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub clusters: BTreeMap<String, ClusterEntry>,
    pub nodes: BTreeMap<String, NodeEntry>,
    pub devices: BTreeMap<String, DeviceEntry>,
    pub bricks: BTreeMap<String, BrickEntry>,
    pub volumes: BTreeMap<String, VolumeEntry>,
    pub block_volumes: BTreeMap<String, BlockVolumeEntry>,
    pub pending_operations: BTreeMap<String, PendingOperationEntry>,
}

/// A record type held in one of the store tables
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn table(tables: &Tables) -> &BTreeMap<String, Self>;
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<String, Self>;
}

macro_rules! entity {
    ($ty:ty, $kind:literal, $field:ident) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn table(tables: &Tables) -> &BTreeMap<String, Self> {
                &tables.$field
            }

            fn table_mut(tables: &mut Tables) -> &mut BTreeMap<String, Self> {
                &mut tables.$field
            }
        }
    };
}

entity!(ClusterEntry, "cluster", clusters);
entity!(NodeEntry, "node", nodes);
entity!(DeviceEntry, "device", devices);
entity!(BrickEntry, "brick", bricks);
entity!(VolumeEntry, "volume", volumes);
entity!(BlockVolumeEntry, "block_volume", block_volumes);
entity!(PendingOperationEntry, "pending_operation", pending_operations);

// =============================================================================
// Transactions
// =============================================================================

/// Typed reads shared by read and write transactions
pub trait TxRead {
    fn tables(&self) -> &Tables;

    fn get<E: Entity>(&self, id: &str) -> Result<E> {
        E::table(self.tables())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(E::KIND, id))
    }

    fn find<E: Entity>(&self, id: &str) -> Option<&E> {
        E::table(self.tables()).get(id)
    }

    fn contains<E: Entity>(&self, id: &str) -> bool {
        E::table(self.tables()).contains_key(id)
    }

    fn keys<E: Entity>(&self) -> Vec<String> {
        E::table(self.tables()).keys().cloned().collect()
    }

    fn list<E: Entity>(&self) -> Vec<E> {
        E::table(self.tables()).values().cloned().collect()
    }
}

pub struct ReadTx<'a> {
    tables: &'a Tables,
}

impl TxRead for ReadTx<'_> {
    fn tables(&self) -> &Tables {
        self.tables
    }
}

pub struct WriteTx<'a> {
    tables: &'a mut Tables,
}

impl TxRead for WriteTx<'_> {
    fn tables(&self) -> &Tables {
        self.tables
    }
}

impl WriteTx<'_> {
    pub fn get_mut<E: Entity>(&mut self, id: &str) -> Result<&mut E> {
        E::table_mut(self.tables)
            .get_mut(id)
            .ok_or_else(|| Error::not_found(E::KIND, id))
    }

    pub fn put<E: Entity>(&mut self, entity: E) {
        E::table_mut(self.tables).insert(entity.id().to_string(), entity);
    }

    /// Insert a record that must not exist yet
    pub fn insert<E: Entity>(&mut self, entity: E) -> Result<()> {
        let table = E::table_mut(self.tables);
        if table.contains_key(entity.id()) {
            return Err(Error::Conflict(format!(
                "{} {} already exists",
                E::KIND,
                entity.id()
            )));
        }
        table.insert(entity.id().to_string(), entity);
        Ok(())
    }

    pub fn delete<E: Entity>(&mut self, id: &str) -> Result<E> {
        E::table_mut(self.tables)
            .remove(id)
            .ok_or_else(|| Error::not_found(E::KIND, id))
    }
}

// =============================================================================
// Store
// =============================================================================

struct StoreInner {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
    lock_timeout: Duration,
}

/// Handle to the shared entity store; clones share state
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn in_memory(lock_timeout: Duration) -> Self {
        Self::with_tables(Tables::default(), None, lock_timeout)
    }

    /// Open a file backed store, creating an empty one if the file is absent
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let tables = if path.exists() {
            let raw = std::fs::read(path)?;
            let tables: Tables = serde_json::from_slice(&raw)?;
            info!(
                "Loaded store from {} ({} pending operations)",
                path.display(),
                tables.pending_operations.len()
            );
            tables
        } else {
            info!("Creating new store at {}", path.display());
            Tables::default()
        };
        Ok(Self::with_tables(
            tables,
            Some(path.to_path_buf()),
            lock_timeout,
        ))
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path, config.lock_timeout()),
            None => Ok(Self::in_memory(config.lock_timeout())),
        }
    }

    fn with_tables(tables: Tables, path: Option<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tables: RwLock::new(tables),
                path,
                lock_timeout,
            }),
        }
    }

    /// Read-only transaction
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T>) -> Result<T> {
        let guard = self.inner.tables.read();
        f(&ReadTx { tables: &guard })
    }

    /// Read-write transaction; commits only when `f` returns `Ok`
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self
            .inner
            .tables
            .try_write_for(self.inner.lock_timeout)
            .ok_or(Error::TxConflict(self.inner.lock_timeout))?;

        let mut working = guard.clone();
        let out = f(&mut WriteTx {
            tables: &mut working,
        })?;

        if let Some(path) = &self.inner.path {
            persist(path, &working)?;
        }
        *guard = working;
        Ok(out)
    }

    /// Copy of every table, for inspection and tests
    pub fn snapshot(&self) -> Tables {
        self.inner.tables.read().clone()
    }
}

fn persist(path: &Path, tables: &Tables) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
    std::fs::rename(&tmp, path)?;
    debug!("Store persisted to {}", path.display());
    Ok(())
}
