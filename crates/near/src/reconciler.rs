//! Applies primary answers for atomic updates to the near store.

use crate::buffer::CircularBuffer;
use crate::config::NearConfig;
use gridcore_common::{Affinity, CacheKey, CacheValue, EntryRemoved, EntryStore, NodeId, TxVersion};
use gridcore_protocol::{NearAtomicUpdateRequest, NearAtomicUpdateResponse};
use std::sync::Arc;
use std::time::Duration;

pub struct NearReconciler {
    local: NodeId,
    affinity: Arc<dyn Affinity>,
    near: Arc<dyn EntryStore>,
    /// Recent near deletes; the oldest is purged when the ring wraps
    deletes: CircularBuffer<(CacheKey, TxVersion)>,
}

impl NearReconciler {
    pub fn new(
        local: NodeId,
        affinity: Arc<dyn Affinity>,
        near: Arc<dyn EntryStore>,
        config: &NearConfig,
    ) -> Self {
        Self {
            local,
            affinity,
            near,
            deletes: CircularBuffer::new(config.delete_history_capacity()),
        }
    }

    pub fn near_store(&self) -> &Arc<dyn EntryStore> {
        &self.near
    }

    /// Deletes still remembered
    pub fn pending_deletes(&self) -> usize {
        self.deletes.len()
    }

    /// Bring the near store in line with `res` for every key of `req`.
    ///
    /// Keys the primary skipped or failed are left alone. If this node now
    /// owns a key its near copy is dropped; otherwise the value generated by
    /// the primary, or the one sent in the request, is written at the
    /// update version. Keys that cannot be applied are added to the failed
    /// keys of `res`.
    pub fn process_near_atomic_update_response(
        &self,
        req: &NearAtomicUpdateRequest,
        res: &mut NearAtomicUpdateResponse,
    ) {
        let Some(version) = req.update_version.or(res.near_version) else {
            tracing::warn!(future = %req.future_id, "atomic update response without a version (will fail keys)");
            for (idx, key) in req.keys.iter().enumerate() {
                if !res.skipped_indexes.contains(&idx) && !res.is_failed(key) {
                    res.add_failed(key.clone(), "update version is missing");
                }
            }
            return;
        };
        let ttl = res.near_ttl_ms.map(Duration::from_millis);

        let mut near_idx = 0;
        for (idx, key) in req.keys.iter().enumerate() {
            if res.skipped_indexes.contains(&idx) || res.is_failed(key) {
                continue;
            }

            if self.affinity.current_nodes(key).contains(&self.local) {
                // This node owns the key now, the near copy is redundant
                if let Some(entry) = self.near.peek(key)
                    && entry.mark_obsolete()
                {
                    self.near.remove_entry(&entry);
                }
                continue;
            }

            let value = if res.near_value_indexes.contains(&idx) {
                let value = res.near_values.get(near_idx).cloned().flatten();
                near_idx += 1;
                value
            } else {
                req.value(idx)
            };

            self.update(key, value, version, ttl);
        }
    }

    fn update(&self, key: &CacheKey, value: Option<CacheValue>, version: TxVersion, ttl: Option<Duration>) {
        loop {
            let entry = self.near.entry(key);
            match entry.inner_set(value.clone(), version, ttl, true) {
                Ok(outcome) => {
                    if let Some(removed) = outcome.remove_version {
                        self.on_deferred_delete(key.clone(), removed);
                    }
                    return;
                }
                Err(EntryRemoved) => {
                    tracing::debug!(key = %key, "got removed entry while updating near value (will retry)");
                }
            }
        }
    }

    /// Remember a delete; purge the oldest one if the history is full.
    pub fn on_deferred_delete(&self, key: CacheKey, version: TxVersion) {
        if let Some((old_key, old_version)) = self.deletes.add((key, version))
            && self.near.remove_versioned(&old_key, old_version)
        {
            tracing::trace!(key = %old_key, version = %old_version, "purged deleted near entry");
        }
    }
}
