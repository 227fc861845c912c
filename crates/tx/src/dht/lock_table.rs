//! Per-key exclusive locks held by transactions on a participant.
//!
//! The table only tracks ownership and reports conflicts; it never waits.
//! The requesting coordinator decides what to do with a conflict.

use gridcore_common::{CacheKey, TxVersion};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Result of attempting to acquire locks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// Every requested lock is held by the requester
    Granted,
    /// A key is locked by another transaction; nothing was acquired
    Conflict { key: CacheKey, holder: TxVersion },
}

#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<CacheKey, TxVersion>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire all `keys` for `version` or none of them. Keys already held
    /// by `version` are re-entered.
    pub fn try_lock_all<'a>(
        &self,
        version: TxVersion,
        keys: impl IntoIterator<Item = &'a CacheKey> + Clone,
    ) -> LockResult {
        let mut locks = self.locks.lock();

        for key in keys.clone() {
            if let Some(holder) = locks.get(key)
                && *holder != version
            {
                return LockResult::Conflict {
                    key: key.clone(),
                    holder: *holder,
                };
            }
        }

        for key in keys {
            locks.insert(key.clone(), version);
        }

        LockResult::Granted
    }

    /// Release every lock held by `version`; returns how many were released
    pub fn release(&self, version: TxVersion) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, holder| *holder != version);
        before - locks.len()
    }

    pub fn holder(&self, key: &CacheKey) -> Option<TxVersion> {
        self.locks.lock().get(key).copied()
    }

    /// Keys held by `version`
    pub fn held_by(&self, version: TxVersion) -> Vec<CacheKey> {
        self.locks
            .lock()
            .iter()
            .filter(|(_, holder)| **holder == version)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcore_common::{NodeId, VersionClock};

    fn keys(names: &[&str]) -> Vec<CacheKey> {
        names.iter().map(|n| CacheKey::from(*n)).collect()
    }

    #[test]
    fn test_basic_lock_acquisition() {
        let clock = VersionClock::new(NodeId::random());
        let table = LockTable::new();
        let tx1 = clock.next();
        let tx2 = clock.next();
        let k = keys(&["a"]);

        assert_eq!(table.try_lock_all(tx1, &k), LockResult::Granted);
        // Re-entry by the holder
        assert_eq!(table.try_lock_all(tx1, &k), LockResult::Granted);

        let result = table.try_lock_all(tx2, &k);
        assert!(matches!(result, LockResult::Conflict { holder, .. } if holder == tx1));
    }

    #[test]
    fn test_all_or_nothing() {
        let clock = VersionClock::new(NodeId::random());
        let table = LockTable::new();
        let tx1 = clock.next();
        let tx2 = clock.next();

        table.try_lock_all(tx1, &keys(&["b"]));
        let result = table.try_lock_all(tx2, &keys(&["a", "b", "c"]));
        assert_eq!(
            result,
            LockResult::Conflict {
                key: CacheKey::from("b"),
                holder: tx1
            }
        );
        assert_eq!(table.holder(&CacheKey::from("a")), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lock_release() {
        let clock = VersionClock::new(NodeId::random());
        let table = LockTable::new();
        let tx1 = clock.next();
        let tx2 = clock.next();

        table.try_lock_all(tx1, &keys(&["a", "b"]));
        assert_eq!(table.held_by(tx1).len(), 2);
        assert_eq!(table.release(tx1), 2);
        assert!(table.is_empty());
        assert_eq!(table.try_lock_all(tx2, &keys(&["a"])), LockResult::Granted);
    }
}
