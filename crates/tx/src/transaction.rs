//! Near (client side) transaction state.
//!
//! A [`NearTx`] collects the keys a caller reads and writes, remembers how
//! they were mapped to nodes and tracks the coordinator-side state machine.
//! Prepare and finish futures drive the state forward.

use crate::config::TxConfig;
use crate::error::{Result, TxError};
use crate::mapping::{TxMapping, TxMappings};
use gridcore_common::{CacheKey, CacheValue, NodeId, TxVersion};
use gridcore_protocol::{Concurrency, EntryOp, TxEntry};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Coordinator-side transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// Can only be rolled back
    MarkedRollback,
    /// Outcome is indeterminate after a heuristic failure
    Unknown,
}

impl TxState {
    fn can_move_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing | RollingBack | MarkedRollback)
                | (Preparing, Prepared | RollingBack | MarkedRollback)
                | (Prepared, Committing | RollingBack | MarkedRollback)
                | (MarkedRollback, RollingBack)
                | (Committing, Committed | Unknown)
                | (RollingBack, RolledBack | Unknown)
        )
    }

    /// No further transition is possible
    pub fn is_final(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Unknown)
    }
}

/// Per-transaction flags fixed at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOptions {
    pub concurrency: Concurrency,
    pub sync_commit: bool,
    pub sync_rollback: bool,
    /// Started implicitly for a single operation, invisible to the caller
    pub implicit: bool,
    /// Close an implicit transaction as soon as its outcome is unknown
    pub system_invalidate: bool,
    /// Participants invalidate instead of updating near copies
    pub invalidate: bool,
    pub thread_id: u64,
}

impl TxOptions {
    pub fn from_config(config: &TxConfig) -> Self {
        Self {
            concurrency: config.default_concurrency,
            sync_commit: config.default_sync_commit,
            sync_rollback: config.default_sync_rollback,
            implicit: false,
            system_invalidate: false,
            invalidate: false,
            thread_id: 0,
        }
    }

    pub fn pessimistic() -> Self {
        Self::from_config(&TxConfig::default())
    }

    pub fn optimistic() -> Self {
        Self {
            concurrency: Concurrency::Optimistic,
            ..Self::pessimistic()
        }
    }

    pub fn with_sync_commit(mut self, sync: bool) -> Self {
        self.sync_commit = sync;
        self
    }

    pub fn with_thread_id(mut self, thread_id: u64) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Single-operation transaction closed on heuristic failure
    pub fn implicit(mut self) -> Self {
        self.implicit = true;
        self.system_invalidate = true;
        self
    }
}

impl Default for TxOptions {
    fn default() -> Self {
        Self::pessimistic()
    }
}

#[derive(Debug)]
struct TxInner {
    reads: Vec<TxEntry>,
    writes: Vec<TxEntry>,
    explicit_locks: HashSet<CacheKey>,
    /// Primaries that granted explicit locks
    lock_nodes: Vec<NodeId>,
    mappings: TxMappings,
    topology_version: Option<u64>,
    state: TxState,
    rollback_only: bool,
    commit_error: Option<TxError>,
    closed: bool,
    one_phase_commit: bool,
    /// Some prepare request was sent without waiting for its answer
    prepare_unconfirmed: bool,
}

/// A transaction started on this node.
#[derive(Debug)]
pub struct NearTx {
    version: TxVersion,
    options: TxOptions,
    inner: Mutex<TxInner>,
}

impl NearTx {
    pub fn new(version: TxVersion, options: TxOptions) -> Self {
        Self {
            version,
            options,
            inner: Mutex::new(TxInner {
                reads: Vec::new(),
                writes: Vec::new(),
                explicit_locks: HashSet::new(),
                lock_nodes: Vec::new(),
                mappings: TxMappings::default(),
                topology_version: None,
                state: TxState::Active,
                rollback_only: false,
                commit_error: None,
                closed: false,
                one_phase_commit: false,
                prepare_unconfirmed: false,
            }),
        }
    }

    pub fn version(&self) -> TxVersion {
        self.version
    }

    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    pub fn concurrency(&self) -> Concurrency {
        self.options.concurrency
    }

    pub fn is_pessimistic(&self) -> bool {
        self.options.concurrency == Concurrency::Pessimistic
    }

    pub fn thread_id(&self) -> u64 {
        self.options.thread_id
    }

    /// Write a value
    pub fn put(&self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) -> Result<()> {
        self.add_write(TxEntry::update(key.into(), value.into()))
    }

    /// Delete a key
    pub fn remove(&self, key: impl Into<CacheKey>) -> Result<()> {
        self.add_write(TxEntry::delete(key.into()))
    }

    /// Record a read; the prepare returns the owner's current value
    pub fn read(&self, key: impl Into<CacheKey>) -> Result<()> {
        let key = key.into();
        let mut inner = self.inner.lock();
        Self::check_active(&inner)?;
        if !inner.reads.iter().any(|e| e.key == key) && !inner.writes.iter().any(|e| e.key == key) {
            inner.reads.push(TxEntry::read(key));
        }
        Ok(())
    }

    fn add_write(&self, entry: TxEntry) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_active(&inner)?;
        inner.reads.retain(|e| e.key != entry.key);
        match inner.writes.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => inner.writes.push(entry),
        }
        Ok(())
    }

    fn check_active(inner: &TxInner) -> Result<()> {
        if inner.state != TxState::Active || inner.closed {
            return Err(TxError::InvalidState(format!(
                "cannot modify transaction in state {:?}",
                inner.state
            )));
        }
        Ok(())
    }

    pub fn reads(&self) -> Vec<TxEntry> {
        self.inner.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<TxEntry> {
        self.inner.lock().writes.clone()
    }

    /// Keys written, deletes included
    pub fn write_keys(&self) -> Vec<CacheKey> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|e| e.op != EntryOp::Read)
            .map(|e| e.key.clone())
            .collect()
    }

    /// Number of entries in the transaction
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.reads.len() + inner.writes.len()
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Move to `next`, failing on a transition the state machine does not allow
    pub fn transition(&self, next: TxState) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == next {
            return Ok(());
        }
        if inner.closed && !next.is_final() {
            return Err(TxError::InvalidState(format!(
                "transaction {} is closed",
                self.version
            )));
        }
        if !inner.state.can_move_to(next) {
            return Err(TxError::InvalidState(format!(
                "cannot move transaction {} from {:?} to {:?}",
                self.version, inner.state, next
            )));
        }
        inner.state = next;
        Ok(())
    }

    /// Mark the transaction as only able to roll back. Returns false if it
    /// already was.
    pub fn set_rollback_only(&self) -> bool {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            TxState::Active | TxState::Preparing | TxState::Prepared
        ) {
            inner.state = TxState::MarkedRollback;
        }
        !std::mem::replace(&mut inner.rollback_only, true)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.inner.lock().rollback_only
    }

    /// Remember the first error that made the commit fail
    pub fn set_commit_error(&self, error: TxError) {
        let mut inner = self.inner.lock();
        if inner.commit_error.is_none() || error.is_heuristic() {
            inner.commit_error = Some(error);
        }
    }

    pub fn commit_error(&self) -> Option<TxError> {
        self.inner.lock().commit_error.clone()
    }

    /// Refuse any further operation; only a final state can still be reached
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn one_phase_commit(&self) -> bool {
        self.inner.lock().one_phase_commit
    }

    pub(crate) fn set_one_phase_commit(&self, one_phase: bool) {
        self.inner.lock().one_phase_commit = one_phase;
    }

    pub fn prepare_unconfirmed(&self) -> bool {
        self.inner.lock().prepare_unconfirmed
    }

    pub(crate) fn set_prepare_unconfirmed(&self) {
        self.inner.lock().prepare_unconfirmed = true;
    }

    pub fn mappings(&self) -> TxMappings {
        self.inner.lock().mappings.clone()
    }

    pub(crate) fn set_mappings(&self, mappings: TxMappings, topology_version: u64) {
        let mut inner = self.inner.lock();
        inner.mappings = mappings;
        inner.topology_version = Some(topology_version);
    }

    pub(crate) fn remove_mapping(&self, node: NodeId) -> Option<TxMapping> {
        self.inner.lock().mappings.remove(node)
    }

    /// Topology version the mappings were computed for
    pub fn topology_version(&self) -> Option<u64> {
        self.inner.lock().topology_version
    }

    pub(crate) fn add_explicit_locks(&self, keys: impl IntoIterator<Item = CacheKey>) {
        self.inner.lock().explicit_locks.extend(keys);
    }

    pub fn has_explicit_lock(&self, key: &CacheKey) -> bool {
        self.inner.lock().explicit_locks.contains(key)
    }

    pub fn explicit_locks(&self) -> Vec<CacheKey> {
        self.inner.lock().explicit_locks.iter().cloned().collect()
    }

    pub(crate) fn add_lock_node(&self, node: NodeId) {
        let mut inner = self.inner.lock();
        if !inner.lock_nodes.contains(&node) {
            inner.lock_nodes.push(node);
        }
    }

    pub fn lock_nodes(&self) -> Vec<NodeId> {
        self.inner.lock().lock_nodes.clone()
    }

    /// Mappings plus a lock-only entry for every primary holding locks
    /// outside them, so that finishing releases every lock.
    pub(crate) fn finish_mappings(&self) -> TxMappings {
        let inner = self.inner.lock();
        let mut mappings = inner.mappings.clone();
        for node in &inner.lock_nodes {
            if mappings.get(*node).is_none() {
                mappings.get_or_insert(*node).explicit_lock = true;
            }
        }
        mappings
    }
}
