//! Common test utilities for integration tests

#![allow(dead_code)]

use gridcore::common::{CacheKey, Cluster, NodeId};
use gridcore::messaging::LocalNetwork;
use gridcore::{GridConfig, GridNode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Install a subscriber once per test binary; `RUST_LOG` controls output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Several nodes sharing one in-memory cluster and network
pub struct TestGrid {
    pub cluster: Arc<Cluster>,
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<GridNode>,
}

impl TestGrid {
    pub fn start(count: usize, config: GridConfig) -> Self {
        init_tracing();
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let nodes = (0..count)
            .map(|_| GridNode::start(&cluster, &network, config.clone()).unwrap())
            .collect();
        Self {
            cluster,
            network,
            nodes,
        }
    }

    pub fn node(&self, idx: usize) -> &GridNode {
        &self.nodes[idx]
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

/// First generated key whose owners start with `owners`
pub fn key_with_owners(node: &GridNode, owners: &[NodeId]) -> CacheKey {
    let affinity = node.affinity();
    (0..)
        .map(|i| CacheKey::from(format!("key-{i}")))
        .find(|key| affinity.current_nodes(key).starts_with(owners))
        .unwrap()
}

/// Await `f`, failing the test after five seconds.
pub async fn bounded<T>(f: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("operation timed out")
}

/// Poll `condition` until it holds (bounded).
pub async fn eventually(condition: impl Fn() -> bool) {
    bounded(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
