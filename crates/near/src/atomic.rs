//! Atomic updates routed through the primary of each key.
//!
//! The requesting node groups keys by primary and sends one
//! [`NearAtomicUpdateRequest`] per primary, short-circuiting when it is the
//! primary itself. The primary assigns the version, writes, replicates to
//! backups without waiting for them and answers with the authoritative
//! outcome, which the [`NearReconciler`] applies to the near store.

use crate::buffer::CircularBuffer;
use crate::config::NearConfig;
use crate::error::{NearError, Result};
use crate::reconciler::NearReconciler;
use dashmap::DashMap;
use gridcore_common::{
    Affinity, CacheKey, CacheValue, EntryStore, FutureId, NodeEvent, NodeId, Subscription,
    TopologyProvider, TxVersion, VersionClock,
};
use gridcore_messaging::{Listener, Messaging};
use gridcore_protocol::{
    AtomicOp, DhtAtomicUpdateRequest, IoPolicy, Message, NearAtomicUpdateRequest,
    NearAtomicUpdateResponse, Topic,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// What the primaries reported for an atomic update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicOutcome {
    /// Version assigned by the (last answering) primary
    pub version: Option<TxVersion>,
    pub failed_keys: Vec<(CacheKey, String)>,
    /// Values the primary kept instead of the requested ones
    pub returned: Vec<(CacheKey, Option<CacheValue>)>,
}

impl AtomicOutcome {
    fn into_result(self) -> Result<Self> {
        if self.failed_keys.is_empty() {
            Ok(self)
        } else {
            Err(NearError::UpdateFailed(self.failed_keys))
        }
    }
}

struct AtomicShared {
    local: NodeId,
    messaging: Messaging,
    affinity: Arc<dyn Affinity>,
    store: Arc<dyn EntryStore>,
    clock: Arc<VersionClock>,
    reconciler: NearReconciler,
    /// Deletes applied to the data store as primary or backup
    deletes: CircularBuffer<(CacheKey, TxVersion)>,
    futures: DashMap<FutureId, Arc<AtomicUpdateFuture>>,
}

impl AtomicShared {
    fn on_message(&self, sender: NodeId, message: &Message) {
        match message {
            Message::NearAtomicUpdateRequest(req) => {
                let res = self.handle_near_update(sender, req);
                if let Err(e) = self.messaging.send(
                    sender,
                    Topic::Cache,
                    Message::NearAtomicUpdateResponse(res),
                    IoPolicy::System,
                ) {
                    tracing::warn!(node = %sender, "failed to send atomic update response: {}", e);
                }
            }
            Message::NearAtomicUpdateResponse(res) => {
                let future = self.futures.get(&res.future_id).map(|f| f.value().clone());
                match future {
                    Some(future) => future.on_response(sender, res.clone()),
                    None => tracing::debug!(
                        node = %sender,
                        future = %res.future_id,
                        "atomic update response for unknown future (will ignore)"
                    ),
                }
            }
            Message::DhtAtomicUpdateRequest(req) => self.handle_dht_update(sender, req),
            _ => {}
        }
    }

    /// Primary side: version, write, replicate, answer.
    fn handle_near_update(&self, sender: NodeId, req: &NearAtomicUpdateRequest) -> NearAtomicUpdateResponse {
        let mut res = NearAtomicUpdateResponse::new(req.future_id);
        let version = match req.update_version {
            Some(version) => {
                self.clock.observe(&version);
                version
            }
            None => self.clock.next(),
        };
        res.near_version = Some(version);
        res.near_ttl_ms = req.ttl_ms;

        let ttl = req.ttl_ms.map(Duration::from_millis);
        let topology_version = self.affinity.topology_version();
        let mut backups: HashMap<NodeId, DhtAtomicUpdateRequest> = HashMap::new();

        for (idx, key) in req.keys.iter().enumerate() {
            let owners = self.affinity.nodes(key, topology_version);
            if owners.first() != Some(&self.local) {
                res.add_failed(key.clone(), format!("node {} is not primary", self.local));
                continue;
            }

            let value = match req.op {
                AtomicOp::Delete => None,
                AtomicOp::Update => match req.value(idx) {
                    Some(value) => Some(value),
                    None => {
                        res.add_failed(key.clone(), "update without a value");
                        continue;
                    }
                },
                AtomicOp::PutIfAbsent => {
                    if let Some(existing) = self.store.value(key) {
                        res.add_near_value(idx, Some(existing));
                        continue;
                    }
                    match req.value(idx) {
                        Some(value) => Some(value),
                        None => {
                            res.add_failed(key.clone(), "update without a value");
                            continue;
                        }
                    }
                }
            };

            match self.store.write(key, value.clone(), version, ttl) {
                Ok(outcome) if !outcome.applied => {
                    // A newer version is already there
                    res.skipped_indexes.push(idx);
                    continue;
                }
                Ok(outcome) => {
                    if let Some(removed) = outcome.remove_version {
                        self.on_deferred_delete(key.clone(), removed);
                    }
                }
                Err(e) => {
                    res.add_failed(key.clone(), e.to_string());
                    continue;
                }
            }

            for backup in owners.iter().skip(1).filter(|n| **n != self.local) {
                let dht = backups.entry(*backup).or_insert_with(|| DhtAtomicUpdateRequest {
                    primary: self.local,
                    version,
                    keys: Vec::new(),
                    values: Vec::new(),
                    ttl_ms: req.ttl_ms,
                });
                dht.keys.push(key.clone());
                dht.values.push(value.clone());
            }
        }

        for (backup, dht) in backups {
            if let Err(e) = self.messaging.send(
                backup,
                Topic::Cache,
                Message::DhtAtomicUpdateRequest(dht),
                IoPolicy::Replication,
            ) {
                tracing::warn!(node = %backup, "failed to replicate atomic update: {}", e);
            }
        }

        tracing::trace!(
            node = %sender,
            version = %version,
            keys = req.keys.len(),
            failed = res.failed_keys.len(),
            "processed atomic update as primary"
        );
        res
    }

    /// Backup side: apply what the primary wrote.
    fn handle_dht_update(&self, sender: NodeId, req: &DhtAtomicUpdateRequest) {
        self.clock.observe(&req.version);
        let ttl = req.ttl_ms.map(Duration::from_millis);

        for (key, value) in req.keys.iter().zip(req.values.iter()) {
            match self.store.write(key, value.clone(), req.version, ttl) {
                Ok(outcome) => {
                    if let Some(removed) = outcome.remove_version {
                        self.on_deferred_delete(key.clone(), removed);
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %sender, key = %key, "failed to apply replicated update: {}", e);
                }
            }
        }
    }

    fn on_deferred_delete(&self, key: CacheKey, version: TxVersion) {
        if let Some((old_key, old_version)) = self.deletes.add((key, version)) {
            self.store.remove_versioned(&old_key, old_version);
        }
    }

    fn on_node_left(&self, node: NodeId) -> usize {
        let futures: Vec<Arc<AtomicUpdateFuture>> =
            self.futures.iter().map(|f| f.value().clone()).collect();
        futures
            .into_iter()
            .filter(|future| future.on_node_left(node))
            .count()
    }
}

/// Completion of one atomic update across its primaries.
pub struct AtomicUpdateFuture {
    id: FutureId,
    op: AtomicOp,
    shared: Arc<AtomicShared>,
    completion: watch::Sender<Option<Result<AtomicOutcome>>>,
    /// Requests still waiting for an answer, by primary
    pending: Mutex<HashMap<NodeId, NearAtomicUpdateRequest>>,
    outcome: Mutex<AtomicOutcome>,
    initialized: AtomicBool,
}

impl AtomicUpdateFuture {
    fn new(shared: Arc<AtomicShared>, op: AtomicOp) -> Self {
        let (completion, _rx) = watch::channel(None);
        Self {
            id: FutureId::new(),
            op,
            shared,
            completion,
            pending: Mutex::new(HashMap::new()),
            outcome: Mutex::new(AtomicOutcome::default()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FutureId {
        self.id
    }

    pub fn op(&self) -> AtomicOp {
        self.op
    }

    pub fn is_done(&self) -> bool {
        self.completion.borrow().is_some()
    }

    pub fn result(&self) -> Option<Result<AtomicOutcome>> {
        self.completion.borrow().clone()
    }

    /// Outcome once every primary answered; failed keys are an error.
    pub async fn wait(&self) -> Result<AtomicOutcome> {
        let mut rx = self.completion.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(NearError::Cancelled)),
            Err(_) => Err(NearError::Cancelled),
        };
        outcome?.into_result()
    }

    fn start(
        self: &Arc<Self>,
        keys: Vec<CacheKey>,
        values: Vec<Option<CacheValue>>,
        ttl: Option<Duration>,
    ) {
        if self.op != AtomicOp::Delete && values.len() != keys.len() {
            self.fail(NearError::InvalidUpdate(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
            return;
        }

        let topology_version = self.shared.affinity.topology_version();
        let mut requests: Vec<(NodeId, NearAtomicUpdateRequest)> = Vec::new();
        for (idx, key) in keys.into_iter().enumerate() {
            let Some(primary) = self.shared.affinity.primary(&key, topology_version) else {
                self.fail(NearError::NoPrimary(key));
                return;
            };
            let pos = match requests.iter().position(|(node, _)| *node == primary) {
                Some(pos) => pos,
                None => {
                    requests.push((
                        primary,
                        NearAtomicUpdateRequest {
                            future_id: self.id,
                            topology_version,
                            op: self.op,
                            keys: Vec::new(),
                            values: Vec::new(),
                            ttl_ms: ttl.map(|t| t.as_millis() as u64),
                            update_version: None,
                        },
                    ));
                    requests.len() - 1
                }
            };
            let req = &mut requests[pos].1;
            req.keys.push(key);
            if self.op != AtomicOp::Delete {
                req.values.push(values[idx].clone());
            }
        }

        self.pending.lock().extend(requests.iter().cloned());
        self.shared.futures.insert(self.id, self.clone());

        for (node, req) in requests {
            if node == self.shared.local {
                let res = self.shared.handle_near_update(node, &req);
                self.on_response(node, res);
                continue;
            }

            tracing::trace!(node = %node, keys = req.keys.len(), "sending atomic update request");
            match self.shared.messaging.send(
                node,
                Topic::Cache,
                Message::NearAtomicUpdateRequest(req),
                IoPolicy::System,
            ) {
                Ok(()) => {}
                Err(e) if e.is_topology() => {
                    self.on_node_left(node);
                }
                Err(e) => self.fail(e.into()),
            }

            if self.is_done() {
                return;
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.check_complete();
    }

    fn on_response(&self, node: NodeId, mut res: NearAtomicUpdateResponse) {
        let Some(req) = self.pending.lock().remove(&node) else {
            tracing::trace!(node = %node, future = %self.id, "duplicate atomic update response");
            return;
        };

        self.shared
            .reconciler
            .process_near_atomic_update_response(&req, &mut res);

        {
            let mut outcome = self.outcome.lock();
            if res.near_version.is_some() {
                outcome.version = res.near_version;
            }
            outcome.failed_keys.append(&mut res.failed_keys);
            for (pos, idx) in res.near_value_indexes.iter().enumerate() {
                if let Some(key) = req.keys.get(*idx) {
                    let value = res.near_values.get(pos).cloned().flatten();
                    outcome.returned.push((key.clone(), value));
                }
            }
        }

        self.check_complete();
    }

    fn on_node_left(&self, node: NodeId) -> bool {
        let Some(req) = self.pending.lock().remove(&node) else {
            return false;
        };
        tracing::debug!(node = %node, future = %self.id, "primary left before answering atomic update");
        self.fail(NearError::Topology {
            node,
            keys: req.keys,
        });
        true
    }

    fn check_complete(&self) {
        if !self.initialized.load(Ordering::SeqCst) || self.is_done() || !self.pending.lock().is_empty() {
            return;
        }
        let outcome = self.outcome.lock().clone();
        if self.complete(Ok(outcome)) {
            tracing::trace!(future = %self.id, "atomic update completed");
        }
    }

    fn fail(&self, error: NearError) {
        tracing::debug!(future = %self.id, "atomic update failed: {}", error);
        self.complete(Err(error));
    }

    fn complete(&self, result: Result<AtomicOutcome>) -> bool {
        let stored = self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if stored {
            self.shared.futures.remove(&self.id);
        }
        stored
    }
}

/// Atomic put/remove on top of primaries, with a near copy on this node.
pub struct NearAtomicCache {
    shared: Arc<AtomicShared>,
    subscription: Mutex<Option<Subscription>>,
}

impl NearAtomicCache {
    pub fn new(
        messaging: Messaging,
        affinity: Arc<dyn Affinity>,
        store: Arc<dyn EntryStore>,
        near_store: Arc<dyn EntryStore>,
        clock: Arc<VersionClock>,
        config: &NearConfig,
    ) -> Self {
        let local = messaging.local_node_id();
        Self {
            shared: Arc::new(AtomicShared {
                local,
                messaging,
                reconciler: NearReconciler::new(local, affinity.clone(), near_store, config),
                affinity,
                store,
                clock,
                deletes: CircularBuffer::new(config.delete_history_capacity()),
                futures: DashMap::new(),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Register the request/response listener and watch for departed primaries.
    pub fn start(&self, topology: &dyn TopologyProvider) {
        self.shared.messaging.add_listener(Topic::Cache, self.listener());

        let shared = Arc::downgrade(&self.shared);
        let subscription = topology.subscribe(Arc::new(move |event: &NodeEvent| {
            if event.is_departure()
                && let Some(shared) = shared.upgrade()
            {
                let failed = shared.on_node_left(event.node().id);
                if failed > 0 {
                    tracing::debug!(node = %event.node().id, failed, "failed atomic updates of departed node");
                }
            }
        }));
        *self.subscription.lock() = Some(subscription);
    }

    pub fn stop(&self) {
        self.subscription.lock().take();
    }

    fn listener(&self) -> Listener {
        let shared: Weak<AtomicShared> = Arc::downgrade(&self.shared);
        Arc::new(move |sender: NodeId, message: &Message| {
            if let Some(shared) = shared.upgrade() {
                shared.on_message(sender, message);
            }
        })
    }

    /// Start an update of `keys`; `values` is ignored for deletes.
    pub fn update(
        &self,
        op: AtomicOp,
        keys: Vec<CacheKey>,
        values: Vec<Option<CacheValue>>,
        ttl: Option<Duration>,
    ) -> Arc<AtomicUpdateFuture> {
        let future = Arc::new(AtomicUpdateFuture::new(self.shared.clone(), op));
        future.start(keys, values, ttl);
        future
    }

    pub async fn put(&self, key: impl Into<CacheKey>, value: impl Into<CacheValue>) -> Result<()> {
        self.put_all(vec![(key.into(), value.into())], None).await
    }

    pub async fn put_all(&self, entries: Vec<(CacheKey, CacheValue)>, ttl: Option<Duration>) -> Result<()> {
        let (keys, values): (Vec<_>, Vec<_>) = entries.into_iter().map(|(k, v)| (k, Some(v))).unzip();
        self.update(AtomicOp::Update, keys, values, ttl).wait().await?;
        Ok(())
    }

    pub async fn remove(&self, key: impl Into<CacheKey>) -> Result<()> {
        self.update(AtomicOp::Delete, vec![key.into()], Vec::new(), None)
            .wait()
            .await?;
        Ok(())
    }

    /// Returns the value already stored, or `None` if `value` was written.
    pub async fn put_if_absent(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<CacheValue>,
    ) -> Result<Option<CacheValue>> {
        let outcome = self
            .update(AtomicOp::PutIfAbsent, vec![key.into()], vec![Some(value.into())], None)
            .wait()
            .await?;
        Ok(outcome.returned.into_iter().next().and_then(|(_, v)| v))
    }

    /// Local view of `key`: the owned copy if this node owns it, else the near copy.
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        if self.shared.affinity.current_nodes(key).contains(&self.shared.local) {
            self.shared.store.value(key)
        } else {
            self.shared.reconciler.near_store().value(key)
        }
    }

    pub fn reconciler(&self) -> &NearReconciler {
        &self.shared.reconciler
    }

    /// Updates still waiting for primaries
    pub fn pending_updates(&self) -> usize {
        self.shared.futures.len()
    }
}
