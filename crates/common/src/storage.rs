//! Entry storage consumed by the grid core.
//!
//! The core only reads and writes versioned values through [`EntryStore`];
//! indexing, eviction and persistence belong to the storage engine.

use crate::key::{CacheKey, CacheValue};
use crate::version::TxVersion;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Storage error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to write key {key}: {message}")]
    WriteFailed { key: CacheKey, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// The entry was removed from its store while being updated; look it up
/// again and retry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("entry was removed concurrently")]
pub struct EntryRemoved;

/// Result of [`CacheEntry::inner_set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// False when a newer version was already present
    pub applied: bool,
    /// Set when the update deleted the value; the caller owns deferred removal
    pub remove_version: Option<TxVersion>,
}

#[derive(Debug, Default)]
struct EntryState {
    value: Option<CacheValue>,
    version: Option<TxVersion>,
    expire_at: Option<Instant>,
    obsolete: bool,
}

/// A single versioned cache entry.
#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::default()),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current value, `None` when absent or expired
    pub fn value(&self) -> Option<CacheValue> {
        let state = self.state.lock();
        match state.expire_at {
            Some(at) if at <= Instant::now() => None,
            _ => state.value.clone(),
        }
    }

    pub fn version(&self) -> Option<TxVersion> {
        self.state.lock().version
    }

    pub fn is_obsolete(&self) -> bool {
        self.state.lock().obsolete
    }

    /// Set the value at `version`.
    ///
    /// With `check_version`, an entry already holding a newer version is left
    /// untouched. A `None` value is a delete and reports its remove version.
    pub fn inner_set(
        &self,
        value: Option<CacheValue>,
        version: TxVersion,
        ttl: Option<Duration>,
        check_version: bool,
    ) -> Result<UpdateOutcome, EntryRemoved> {
        let mut state = self.state.lock();
        if state.obsolete {
            return Err(EntryRemoved);
        }

        if check_version
            && let Some(current) = state.version
            && current > version
        {
            return Ok(UpdateOutcome {
                applied: false,
                remove_version: None,
            });
        }

        let deleted = value.is_none();
        state.value = value;
        state.version = Some(version);
        state.expire_at = ttl.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);

        Ok(UpdateOutcome {
            applied: true,
            remove_version: deleted.then_some(version),
        })
    }

    /// Clear the value because its outcome is indeterminate.
    pub fn invalidate(&self, version: TxVersion) -> bool {
        let mut state = self.state.lock();
        if state.obsolete {
            return false;
        }
        state.value = None;
        state.version = Some(state.version.map_or(version, |v| v.max(version)));
        true
    }

    /// Mark as obsolete; returns false if it already was.
    pub fn mark_obsolete(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.obsolete, true)
    }

    fn is_deleted_at(&self, version: TxVersion) -> bool {
        let state = self.state.lock();
        state.obsolete || (state.value.is_none() && state.version == Some(version))
    }
}

/// Storage engine interface.
pub trait EntryStore: Send + Sync {
    /// Existing entry, if any
    fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>>;

    /// Existing entry or a fresh empty one
    fn entry(&self, key: &CacheKey) -> Arc<CacheEntry>;

    /// Mark the entry obsolete and drop it from the store
    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool;

    /// Drop the entry if it is still the delete recorded at `version`
    fn remove_versioned(&self, key: &CacheKey, version: TxVersion) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed write of a value (or delete with `None`).
    fn write(
        &self,
        key: &CacheKey,
        value: Option<CacheValue>,
        version: TxVersion,
        ttl: Option<Duration>,
    ) -> Result<UpdateOutcome, StorageError> {
        loop {
            match self.entry(key).inner_set(value.clone(), version, ttl, true) {
                Ok(outcome) => return Ok(outcome),
                Err(EntryRemoved) => {
                    tracing::debug!(key = %key, "entry removed during write, retrying");
                }
            }
        }
    }

    fn value(&self, key: &CacheKey) -> Option<CacheValue> {
        self.peek(key).and_then(|e| e.value())
    }
}

/// In-memory store backed by a sharded map.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

impl EntryStore for MemoryStore {
    fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_obsolete() {
                    let fresh = Arc::new(CacheEntry::new(key.clone()));
                    occupied.insert(fresh.clone());
                    fresh
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(CacheEntry::new(key.clone()));
                vacant.insert(fresh.clone());
                fresh
            }
        }
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        entry.mark_obsolete();
        self.entries
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    fn remove_versioned(&self, key: &CacheKey, version: TxVersion) -> bool {
        match self
            .entries
            .remove_if(key, |_, current| current.is_deleted_at(version))
        {
            Some((_, entry)) => {
                entry.mark_obsolete();
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
