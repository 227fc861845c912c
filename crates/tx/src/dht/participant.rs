//! Lock, prepare and finish handling on the nodes that own the data.

use super::lock_table::{LockResult, LockTable};
use gridcore_common::{
    Affinity, CacheKey, EntryStore, NodeId, StorageError, TxVersion, VersionClock,
};
use gridcore_messaging::{Listener, Messaging};
use gridcore_protocol::{
    EntryOp, FinishRequest, FinishResponse, IoPolicy, LockRequest, LockResponse, Message,
    OwnedValue, PrepareRequest, PrepareResponse, RemoteError, Topic, TxEntry,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A transaction as seen by a participant
#[derive(Debug, Clone)]
struct RemoteTx {
    near_node: NodeId,
    /// Writes staged by prepare, applied on commit
    writes: Vec<TxEntry>,
}

/// Bounded memory of finished versions
struct FinishedHistory {
    order: VecDeque<TxVersion>,
    versions: HashSet<TxVersion>,
    capacity: usize,
}

impl FinishedHistory {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            versions: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn record(&mut self, version: TxVersion) {
        if !self.versions.insert(version) {
            return;
        }
        self.order.push_back(version);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.versions.remove(&oldest);
            }
        }
    }

    fn contains(&self, version: &TxVersion) -> bool {
        self.versions.contains(version)
    }
}

/// Serves transaction requests for the keys this node owns.
pub struct TxParticipant {
    local: NodeId,
    messaging: Messaging,
    affinity: Arc<dyn Affinity>,
    store: Arc<dyn EntryStore>,
    clock: Arc<VersionClock>,
    locks: LockTable,
    active: DashMap<TxVersion, RemoteTx>,
    finished: Mutex<FinishedHistory>,
}

impl TxParticipant {
    pub fn new(
        messaging: Messaging,
        affinity: Arc<dyn Affinity>,
        store: Arc<dyn EntryStore>,
        clock: Arc<VersionClock>,
        finished_history: usize,
    ) -> Self {
        Self {
            local: messaging.local_node_id(),
            messaging,
            affinity,
            store,
            clock,
            locks: LockTable::new(),
            active: DashMap::new(),
            finished: Mutex::new(FinishedHistory::new(finished_history)),
        }
    }

    /// Listener serving requests received on [`Topic::Cache`]
    pub fn listener(self: &Arc<Self>) -> Listener {
        let participant = Arc::downgrade(self);
        Arc::new(move |sender: NodeId, message: &Message| {
            if let Some(participant) = participant.upgrade() {
                participant.on_message(sender, message);
            }
        })
    }

    fn on_message(&self, sender: NodeId, message: &Message) {
        let response = match message {
            Message::LockRequest(req) => Message::LockResponse(self.handle_lock(sender, req)),
            Message::PrepareRequest(req) => {
                Message::PrepareResponse(self.handle_prepare(sender, req))
            }
            Message::FinishRequest(req) => {
                let res = self.handle_finish(sender, req);
                if !req.sync && !req.explicit_lock && res.error.is_none() {
                    return;
                }
                Message::FinishResponse(res)
            }
            _ => return,
        };

        if let Err(e) = self
            .messaging
            .send(sender, Topic::Cache, response, IoPolicy::System)
        {
            tracing::warn!(node = %sender, "failed to send transaction response: {}", e);
        }
    }

    /// Acquire explicit locks for keys this node is primary for.
    pub fn handle_lock(&self, sender: NodeId, req: &LockRequest) -> LockResponse {
        let version = req.ctx.version;
        self.clock.observe(&version);

        let mut res = LockResponse {
            ctx: req.ctx.clone(),
            pending: Vec::new(),
            error: None,
        };

        if self.finished.lock().contains(&version) {
            res.error = Some(RemoteError::Rollback("transaction already finished".into()));
            return res;
        }

        let topology_version = self.affinity.topology_version();
        if let Some(key) = req
            .keys
            .iter()
            .find(|k| self.affinity.primary(k, topology_version) != Some(self.local))
        {
            res.error = Some(RemoteError::NotOwner(key.clone()));
            return res;
        }

        match self.locks.try_lock_all(version, &req.keys) {
            LockResult::Granted => {
                self.active.entry(version).or_insert_with(|| RemoteTx {
                    near_node: sender,
                    writes: Vec::new(),
                });
                res.pending = self.pending_before(version);
                tracing::debug!(tx = %version, keys = req.keys.len(), "explicit locks granted");
            }
            LockResult::Conflict { key, holder } => {
                res.error = Some(RemoteError::LockConflict { key, holder });
            }
        }

        res
    }

    /// Validate ownership, lock writes and stage them. A one-phase request
    /// commits on the spot.
    pub fn handle_prepare(&self, sender: NodeId, req: &PrepareRequest) -> PrepareResponse {
        let version = req.ctx.version;
        self.clock.observe(&version);

        let mut res = PrepareResponse {
            ctx: req.ctx.clone(),
            invalid_partitions: Vec::new(),
            pending: Vec::new(),
            owned_values: Vec::new(),
            error: None,
        };

        if self.finished.lock().contains(&version) {
            tracing::debug!(tx = %version, "rejecting prepare of finished transaction");
            res.error = Some(RemoteError::Rollback("transaction already finished".into()));
            return res;
        }

        let mut invalid = BTreeSet::new();
        let mut reads: Vec<&TxEntry> = Vec::new();
        let mut writes: Vec<TxEntry> = Vec::new();
        for entry in req.reads.iter().chain(req.writes.iter()) {
            if !self.affinity.current_nodes(&entry.key).contains(&self.local) {
                invalid.insert(self.affinity.partition(&entry.key));
            } else if entry.is_write() {
                writes.push(entry.clone());
            } else {
                reads.push(entry);
            }
        }
        res.invalid_partitions = invalid.into_iter().collect();

        let write_keys: Vec<&CacheKey> = writes.iter().map(|e| &e.key).collect();
        if let LockResult::Conflict { key, holder } =
            self.locks.try_lock_all(version, write_keys.iter().copied())
        {
            tracing::debug!(tx = %version, key = %key, holder = %holder, "prepare lock conflict");
            res.error = Some(RemoteError::LockConflict { key, holder });
            return res;
        }

        res.pending = self.pending_before(version);
        res.owned_values = reads
            .into_iter()
            .filter_map(|entry| {
                let cached = self.store.peek(&entry.key)?;
                Some(OwnedValue {
                    key: entry.key.clone(),
                    version: cached.version()?,
                    value: cached.value(),
                })
            })
            .collect();

        self.active
            .entry(version)
            .and_modify(|tx| tx.writes = writes.clone())
            .or_insert_with(|| RemoteTx {
                near_node: sender,
                writes,
            });

        // A finish may have overtaken this prepare
        if self.finished.lock().contains(&version) {
            self.discard(version);
            res.error = Some(RemoteError::Rollback("transaction already finished".into()));
            return res;
        }

        if req.one_phase_commit
            && let Err(e) = self.commit(version, None)
        {
            tracing::error!(tx = %version, "one-phase commit failed: {}", e);
            res.error = Some(RemoteError::Heuristic(e.to_string()));
        }

        res
    }

    /// Commit or roll back, then release the transaction's locks.
    pub fn handle_finish(&self, _sender: NodeId, req: &FinishRequest) -> FinishResponse {
        let version = req.ctx.version;
        self.clock.observe(&version);

        let mut res = FinishResponse {
            ctx: req.ctx.clone(),
            error: None,
        };

        if req.commit {
            if let Some(writes) = req.writes.as_deref()
                && let LockResult::Conflict { key, holder } = self.lock_writes(version, writes)
            {
                tracing::warn!(
                    tx = %version,
                    key = %key,
                    holder = %holder,
                    "refusing commit of writes locked by another transaction"
                );
                self.discard(version);
                res.error = Some(RemoteError::LockConflict { key, holder });
                return res;
            }

            if let Err(e) = self.commit(version, req.writes.as_deref()) {
                tracing::error!(tx = %version, "commit failed, transaction outcome is unknown: {}", e);
                res.error = Some(RemoteError::Heuristic(e.to_string()));
            }
        } else {
            self.discard(version);
            tracing::debug!(tx = %version, "rolled back");
        }

        res
    }

    /// Roll back transactions started by a departed node.
    pub fn on_node_left(&self, node: NodeId) -> usize {
        let orphans: Vec<TxVersion> = self
            .active
            .iter()
            .filter(|tx| tx.near_node == node)
            .map(|tx| *tx.key())
            .collect();

        for version in &orphans {
            tracing::debug!(tx = %version, node = %node, "rolling back transaction of departed node");
            self.discard(*version);
        }

        orphans.len()
    }

    /// Apply `writes` (or the staged ones), then forget the transaction
    fn commit(&self, version: TxVersion, writes: Option<&[TxEntry]>) -> Result<usize, StorageError> {
        let staged = self.active.remove(&version).map(|(_, tx)| tx.writes);
        let result = match writes {
            Some(writes) => self.apply(version, writes),
            None => self.apply(version, staged.as_deref().unwrap_or_default()),
        };

        self.locks.release(version);
        self.finished.lock().record(version);
        result
    }

    /// Lock the keys of `writes` this node owns for `version`. Locks taken
    /// by its prepare are re-entered; free keys are taken when the finish
    /// overtook the prepare.
    fn lock_writes(&self, version: TxVersion, writes: &[TxEntry]) -> LockResult {
        let keys: Vec<&CacheKey> = writes
            .iter()
            .filter(|e| e.is_write() && self.affinity.current_nodes(&e.key).contains(&self.local))
            .map(|e| &e.key)
            .collect();
        self.locks.try_lock_all(version, keys.iter().copied())
    }

    fn discard(&self, version: TxVersion) {
        self.active.remove(&version);
        self.locks.release(version);
        self.finished.lock().record(version);
    }

    fn apply(&self, version: TxVersion, writes: &[TxEntry]) -> Result<usize, StorageError> {
        let mut applied = 0;

        for entry in writes.iter().filter(|e| e.is_write()) {
            if !self.affinity.current_nodes(&entry.key).contains(&self.local) {
                tracing::trace!(key = %entry.key, "skipping write for key owned elsewhere");
                continue;
            }

            let value = match entry.op {
                EntryOp::Update => entry.value.clone(),
                EntryOp::Delete | EntryOp::Read => None,
            };
            let ttl = entry.ttl_ms.map(Duration::from_millis);
            self.store.write(&entry.key, value, version, ttl)?;
            applied += 1;
        }

        Ok(applied)
    }

    /// Active transactions older than `version`
    fn pending_before(&self, version: TxVersion) -> Vec<TxVersion> {
        let mut pending: Vec<TxVersion> = self
            .active
            .iter()
            .map(|tx| *tx.key())
            .filter(|v| *v < version)
            .collect();
        pending.sort();
        pending
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Transactions prepared or locked here and not yet finished
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }
}
