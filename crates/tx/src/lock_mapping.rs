//! Grouping of lock keys by the node that grants them.

use crate::error::{Result, TxError};
use gridcore_common::{Affinity, CacheKey, NodeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Keys whose lock is granted by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMappingEntry {
    pub node: NodeId,
    /// All keys mapped to the node
    pub keys: Vec<CacheKey>,
    /// Keys that still have to be requested (not held through re-entry)
    pub distributed_keys: Vec<CacheKey>,
}

/// Maps lock keys to their primary owners
#[derive(Clone)]
pub struct LockMapper {
    affinity: Arc<dyn Affinity>,
}

impl LockMapper {
    pub fn new(affinity: Arc<dyn Affinity>) -> Self {
        Self { affinity }
    }

    /// Group `keys` by primary under `topology_version`. Entries keep the
    /// order in which their node was first seen; `already_locked` filters
    /// the distributed subset.
    pub fn map_keys_to_nodes<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a CacheKey>,
        topology_version: u64,
        already_locked: impl Fn(&CacheKey) -> bool,
    ) -> Result<Vec<LockMappingEntry>> {
        let mut entries: Vec<LockMappingEntry> = Vec::new();
        let mut index: HashMap<NodeId, usize> = HashMap::new();

        for key in keys {
            let node = self
                .affinity
                .primary(key, topology_version)
                .ok_or_else(|| TxError::NoPrimary(key.clone()))?;

            let idx = *index.entry(node).or_insert_with(|| {
                entries.push(LockMappingEntry {
                    node,
                    keys: Vec::new(),
                    distributed_keys: Vec::new(),
                });
                entries.len() - 1
            });

            let entry = &mut entries[idx];
            if entry.keys.contains(key) {
                continue;
            }
            entry.keys.push(key.clone());
            if !already_locked(key) {
                entry.distributed_keys.push(key.clone());
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Affinity pinning keys to nodes by their first byte
    struct Fixed {
        nodes: Vec<NodeId>,
    }

    impl Affinity for Fixed {
        fn partition(&self, key: &CacheKey) -> u32 {
            key.as_bytes()[0] as u32
        }

        fn nodes(&self, key: &CacheKey, _topology_version: u64) -> Vec<NodeId> {
            if self.nodes.is_empty() {
                return Vec::new();
            }
            vec![self.nodes[self.partition(key) as usize % self.nodes.len()]]
        }

        fn topology_version(&self) -> u64 {
            1
        }
    }

    #[test]
    fn test_first_seen_order_and_reentry() {
        let nodes = vec![NodeId::random(), NodeId::random()];
        let mapper = LockMapper::new(Arc::new(Fixed {
            nodes: nodes.clone(),
        }));

        // '1' (49) maps to node 1, '0' (48) and '2' (50) to node 0
        let keys: Vec<CacheKey> = ["1a", "0a", "2b", "1c", "0a"]
            .into_iter()
            .map(CacheKey::from)
            .collect();
        let held = CacheKey::from("2b");

        let entries = mapper.map_keys_to_nodes(&keys, 1, |k| *k == held).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].node, nodes[1]);
        assert_eq!(entries[0].keys, vec![CacheKey::from("1a"), CacheKey::from("1c")]);
        assert_eq!(entries[1].node, nodes[0]);
        assert_eq!(entries[1].keys, vec![CacheKey::from("0a"), CacheKey::from("2b")]);
        assert_eq!(entries[1].distributed_keys, vec![CacheKey::from("0a")]);
    }

    #[test]
    fn test_empty_topology_fails() {
        let mapper = LockMapper::new(Arc::new(Fixed { nodes: Vec::new() }));
        let key = CacheKey::from("k");
        let result = mapper.map_keys_to_nodes([&key], 1, |_| false);
        assert_eq!(result, Err(TxError::NoPrimary(key)));
    }
}
