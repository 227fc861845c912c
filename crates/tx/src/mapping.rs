//! Partition of a transaction's entries by destination node.

use crate::error::{Result, TxError};
use crate::transaction::NearTx;
use gridcore_common::{Affinity, CacheKey, NodeId};
use gridcore_protocol::TxEntry;

/// Entries of one transaction destined for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMapping {
    pub node: NodeId,
    pub reads: Vec<TxEntry>,
    pub writes: Vec<TxEntry>,
    /// Every key of the mapping is covered by a lock the caller already holds
    pub explicit_lock: bool,
}

impl TxMapping {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            reads: Vec::new(),
            writes: Vec::new(),
            explicit_lock: false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.reads.iter().chain(self.writes.iter()).map(|e| &e.key)
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

/// Mappings in the order their nodes were first seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMappings {
    entries: Vec<TxMapping>,
}

impl TxMappings {
    pub fn get(&self, node: NodeId) -> Option<&TxMapping> {
        self.entries.iter().find(|m| m.node == node)
    }

    pub(crate) fn get_or_insert(&mut self, node: NodeId) -> &mut TxMapping {
        let idx = match self.entries.iter().position(|m| m.node == node) {
            Some(idx) => idx,
            None => {
                self.entries.push(TxMapping::new(node));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx]
    }

    pub fn remove(&mut self, node: NodeId) -> Option<TxMapping> {
        let idx = self.entries.iter().position(|m| m.node == node)?;
        Some(self.entries.remove(idx))
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.entries.iter().map(|m| m.node).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxMapping> {
        self.entries.iter()
    }

    /// Whether any mapping still carries `key`
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.entries.iter().any(|m| m.keys().any(|k| k == key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map writes to every owner and reads to the primary.
    pub fn build(tx: &NearTx, affinity: &dyn Affinity, topology_version: u64) -> Result<Self> {
        let mut mappings = TxMappings::default();

        for entry in tx.writes() {
            let owners = affinity.nodes(&entry.key, topology_version);
            if owners.is_empty() {
                return Err(TxError::NoPrimary(entry.key));
            }
            for node in owners {
                mappings.get_or_insert(node).writes.push(entry.clone());
            }
        }

        for entry in tx.reads() {
            let primary = affinity
                .primary(&entry.key, topology_version)
                .ok_or_else(|| TxError::NoPrimary(entry.key.clone()))?;
            mappings.get_or_insert(primary).reads.push(entry);
        }

        for mapping in &mut mappings.entries {
            let covered = mapping.keys().all(|k| tx.has_explicit_lock(k));
            mapping.explicit_lock = covered;
        }

        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxOptions;
    use gridcore_common::{Cluster, RendezvousAffinity, TopologyProvider, TxVersion};
    use std::sync::Arc;

    #[test]
    fn test_writes_go_to_all_owners_reads_to_primary() {
        let cluster = Cluster::new();
        let topology = cluster.join(NodeId::random());
        for _ in 0..3 {
            cluster.join(NodeId::random());
        }
        let affinity = RendezvousAffinity::new(topology.clone(), 64, 1);
        let topver = topology.topology_version();

        let tx = NearTx::new(TxVersion::new(1, 0, NodeId::random()), TxOptions::pessimistic());
        tx.put("k", "v").unwrap();
        tx.read("r").unwrap();

        let mappings = TxMappings::build(&tx, &affinity, topver).unwrap();
        let owners = affinity.nodes(&CacheKey::from("k"), topver);
        assert_eq!(owners.len(), 2);
        for owner in &owners {
            let mapping = mappings.get(*owner).unwrap();
            assert_eq!(mapping.writes.len(), 1);
        }

        let primary = affinity.primary(&CacheKey::from("r"), topver).unwrap();
        assert!(mappings.get(primary).unwrap().reads.iter().any(|e| e.key == CacheKey::from("r")));
        assert!(mappings.contains_key(&CacheKey::from("r")));
        assert!(mappings.iter().all(|m| !m.explicit_lock));
    }

    #[test]
    fn test_explicit_lock_flag() {
        let cluster = Cluster::new();
        let topology = cluster.join(NodeId::random());
        let affinity = RendezvousAffinity::new(topology.clone() as Arc<dyn TopologyProvider>, 8, 0);

        let tx = NearTx::new(TxVersion::new(1, 0, NodeId::random()), TxOptions::pessimistic());
        tx.put("k", "v").unwrap();
        tx.add_explicit_locks([CacheKey::from("k")]);

        let mappings = TxMappings::build(&tx, &affinity, topology.topology_version()).unwrap();
        assert_eq!(mappings.len(), 1);
        assert!(mappings.iter().all(|m| m.explicit_lock));
    }
}
