//! Shared setup for the integration tests: a simulated three node cluster
//! behind a fault injecting executor.

#![allow(dead_code)]

use brickyard::capacity::GIB;
use brickyard::config::{ExecutorConfig, OperationsConfig};
use brickyard::executor::{FakeCluster, InjectConfig, InjectExecutor};
use brickyard::model::{ClusterEntry, DeviceEntry, NodeEntry, VolumeEntry};
use brickyard::operations::DeviceAddOperation;
use brickyard::{Metrics, OperationContext, OperationManager, StorageCommands, Store};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const NODES: usize = 3;
pub const DEVICES_PER_NODE: usize = 2;
pub const DISK_SIZE: u64 = 500 * GIB;

pub struct Harness {
    pub store: Store,
    pub fake: Arc<FakeCluster>,
    pub inject: Arc<InjectExecutor>,
    pub manager: Arc<OperationManager>,
    pub cluster_id: String,
}

pub fn hostname(n: usize) -> String {
    format!("host{}", n)
}

pub fn disk(d: usize) -> String {
    format!("/dev/sd{}", (b'b' + d as u8) as char)
}

impl Harness {
    /// Empty store and a fresh simulated cluster
    pub async fn new() -> Self {
        Self::with_store(
            Store::in_memory(Duration::from_secs(1)),
            OperationsConfig::default(),
        )
        .await
    }

    /// Store persisted to `path`
    pub async fn persistent(path: &Path) -> Self {
        let store = Store::open(path, Duration::from_secs(1)).unwrap();
        Self::with_store(store, OperationsConfig::default()).await
    }

    /// Register the nodes and run a device add for every disk
    pub async fn with_store(store: Store, config: OperationsConfig) -> Self {
        let fake = Arc::new(FakeCluster::new());
        let mut cluster = ClusterEntry::new();
        let mut nodes = Vec::new();
        for n in 0..NODES {
            fake.add_host(&hostname(n));
            for d in 0..DEVICES_PER_NODE {
                fake.add_disk(&hostname(n), &disk(d), DISK_SIZE);
            }
            let node = NodeEntry::new(&cluster.id, &hostname(n), n as u32);
            cluster.nodes.push(node.id.clone());
            nodes.push(node);
        }
        let cluster_id = cluster.id.clone();
        store
            .update(|tx| {
                for node in nodes.iter().cloned() {
                    tx.insert(node)?;
                }
                tx.insert(cluster)
            })
            .unwrap();

        let harness = Self::attach(store, fake, config, cluster_id);
        for node in &nodes {
            for d in 0..DEVICES_PER_NODE {
                let mut op = DeviceAddOperation::new(harness.ctx(), &node.id, &disk(d));
                harness.manager.run(&mut op).await.unwrap();
            }
        }
        harness
    }

    /// New manager over an existing store and cluster, as after a restart
    pub fn attach(
        store: Store,
        fake: Arc<FakeCluster>,
        config: OperationsConfig,
        cluster_id: String,
    ) -> Self {
        let inject = Arc::new(InjectExecutor::new(fake.clone(), &InjectConfig::default()).unwrap());
        let commands = StorageCommands::new(inject.clone(), ExecutorConfig::default());
        let ctx = OperationContext::new(store.clone(), &config);
        let manager = OperationManager::new(ctx, commands, Metrics::unregistered().unwrap());
        Self {
            store,
            fake,
            inject,
            manager,
            cluster_id,
        }
    }

    pub fn ctx(&self) -> OperationContext {
        self.manager.context().clone()
    }

    pub fn hooks(&self, config: InjectConfig) {
        self.inject.set_hooks(&config).unwrap();
    }

    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.store.snapshot().devices.into_values().collect()
    }

    pub fn volume(&self, id: &str) -> VolumeEntry {
        self.store.snapshot().volumes[id].clone()
    }

    /// KiB used across every device in the store
    pub fn used(&self) -> u64 {
        self.devices().iter().map(|d| d.storage.used).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.store.snapshot().pending_operations.len()
    }

    /// Store accounting balances and agrees with the hosts
    pub fn assert_conserved(&self) {
        for device in self.devices() {
            assert_eq!(
                device.storage.free + device.storage.used,
                device.storage.total,
                "device {} out of balance",
                device.id
            );
        }
        assert_eq!(self.used(), self.fake.allocated());
    }
}
