//! Key to partition to node assignment.

use crate::ids::NodeId;
use crate::key::CacheKey;
use crate::topology::TopologyProvider;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Decides which nodes own a key under a topology version.
pub trait Affinity: Send + Sync {
    fn partition(&self, key: &CacheKey) -> u32;

    /// Owners of the key's partition, primary first, then backups
    fn nodes(&self, key: &CacheKey, topology_version: u64) -> Vec<NodeId>;

    /// Latest topology version known to this affinity
    fn topology_version(&self) -> u64;

    fn primary(&self, key: &CacheKey, topology_version: u64) -> Option<NodeId> {
        self.nodes(key, topology_version).first().copied()
    }

    /// Owners under the latest topology version
    fn current_nodes(&self, key: &CacheKey) -> Vec<NodeId> {
        self.nodes(key, self.topology_version())
    }
}

/// Highest-random-weight assignment of partitions to nodes.
pub struct RendezvousAffinity {
    topology: Arc<dyn TopologyProvider>,
    partitions: u32,
    backups: usize,
}

impl RendezvousAffinity {
    pub fn new(topology: Arc<dyn TopologyProvider>, partitions: u32, backups: usize) -> Self {
        Self {
            topology,
            partitions: partitions.max(1),
            backups,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    fn weight(partition: u32, node: &NodeId) -> u64 {
        let mut hasher = DefaultHasher::new();
        partition.hash(&mut hasher);
        node.hash(&mut hasher);
        hasher.finish()
    }
}

impl Affinity for RendezvousAffinity {
    fn partition(&self, key: &CacheKey) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as u32
    }

    fn nodes(&self, key: &CacheKey, topology_version: u64) -> Vec<NodeId> {
        let members = self
            .topology
            .snapshot(topology_version)
            .unwrap_or_else(|| self.topology.nodes());

        let partition = self.partition(key);
        let mut weighted: Vec<(u64, NodeId)> = members
            .iter()
            .map(|n| (Self::weight(partition, &n.id), n.id))
            .collect();
        weighted.sort_by(|a, b| b.cmp(a));

        weighted
            .into_iter()
            .take(self.backups + 1)
            .map(|(_, id)| id)
            .collect()
    }

    fn topology_version(&self) -> u64 {
        self.topology.topology_version()
    }
}
