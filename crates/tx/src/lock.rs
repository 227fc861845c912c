//! Explicit lock acquisition on primaries.

use crate::coordinator::TxShared;
use crate::error::{Result, TxError};
use crate::future::{Completion, MiniFuture, MiniFutures};
use crate::lock_mapping::LockMapper;
use crate::registry::TxFuture;
use crate::transaction::{NearTx, TxState};
use gridcore_common::{CacheKey, FutureId, NodeId, TxVersion};
use gridcore_protocol::{IoPolicy, LockRequest, LockResponse, Message, Topic, TxContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Locks the given keys for a transaction. Completes with the versions of
/// older transactions active on the primaries.
pub struct LockFuture {
    id: FutureId,
    tx: Arc<NearTx>,
    shared: Arc<TxShared>,
    keys: Vec<CacheKey>,
    minis: MiniFutures,
    /// Keys requested from each node
    requested: Mutex<HashMap<NodeId, Vec<CacheKey>>>,
    initialized: AtomicBool,
    pending: Mutex<Vec<TxVersion>>,
    completion: Completion<Vec<TxVersion>>,
}

impl LockFuture {
    pub(crate) fn new(tx: Arc<NearTx>, shared: Arc<TxShared>, keys: Vec<CacheKey>) -> Arc<Self> {
        Arc::new(Self {
            id: FutureId::new(),
            tx,
            shared,
            keys,
            minis: MiniFutures::default(),
            requested: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            completion: Completion::new(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub async fn wait(&self) -> Result<Vec<TxVersion>> {
        self.completion.wait().await
    }

    pub(crate) fn start(self: &Arc<Self>, mapper: &LockMapper) {
        if self.tx.state() != TxState::Active || self.tx.is_closed() {
            self.fail(TxError::InvalidState(format!(
                "cannot lock keys in state {:?}",
                self.tx.state()
            )));
            return;
        }

        let topology_version = self.shared.affinity.topology_version();
        let entries = match mapper.map_keys_to_nodes(&self.keys, topology_version, |k| {
            self.tx.has_explicit_lock(k)
        }) {
            Ok(entries) => entries,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.shared.futures.add(self.clone());

        for entry in entries {
            if entry.distributed_keys.is_empty() {
                continue;
            }

            let mini = self.minis.add(entry.node);
            self.requested
                .lock()
                .insert(entry.node, entry.distributed_keys.clone());
            let req = LockRequest {
                ctx: TxContext {
                    version: self.tx.version(),
                    future_id: self.id,
                    mini_id: mini.id(),
                },
                thread_id: self.tx.thread_id(),
                topology_version,
                keys: entry.distributed_keys,
            };

            if entry.node == self.shared.local {
                let res = self.shared.participant.handle_lock(self.shared.local, &req);
                self.on_lock_response(&mini, &res);
            } else {
                match self.shared.messaging.send(
                    entry.node,
                    Topic::Cache,
                    Message::LockRequest(req),
                    IoPolicy::System,
                ) {
                    Ok(()) => {}
                    Err(e) if e.is_topology() => {
                        self.on_node_left(entry.node);
                    }
                    Err(e) => self.fail(e.into()),
                }
            }

            if self.completion.is_done() {
                return;
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.check_complete();
    }

    fn on_lock_response(&self, mini: &MiniFuture, res: &LockResponse) {
        if mini.resolve().is_err() {
            return;
        }

        if let Some(cause) = &res.error {
            self.fail(TxError::Lock {
                node: mini.node(),
                cause: cause.clone(),
            });
            return;
        }

        self.tx.add_lock_node(mini.node());
        {
            let mut pending = self.pending.lock();
            pending.extend(res.pending.iter().copied());
            pending.sort();
            pending.dedup();
        }

        self.check_complete();
    }

    fn check_complete(&self) {
        if !self.initialized.load(Ordering::SeqCst)
            || self.completion.is_done()
            || !self.minis.all_resolved()
        {
            return;
        }

        self.tx.add_explicit_locks(self.keys.iter().cloned());
        let pending = self.pending.lock().clone();
        if self.completion.complete(Ok(pending)) {
            self.shared.futures.remove(self.id);
            tracing::debug!(tx = %self.tx.version(), keys = self.keys.len(), "explicit locks acquired");
        }
    }

    fn fail(&self, error: TxError) {
        tracing::debug!(tx = %self.tx.version(), "lock failed: {}", error);
        if self.completion.complete(Err(error)) {
            self.shared.futures.remove(self.id);
        }
    }
}

impl TxFuture for LockFuture {
    fn future_id(&self) -> FutureId {
        self.id
    }

    /// Locks held by a departed primary are gone, so the lock fails
    fn on_node_left(&self, node: NodeId) -> bool {
        let waiting = self.minis.unresolved_for(node);
        if waiting.is_empty() {
            return false;
        }
        for mini in &waiting {
            let _ = mini.resolve();
        }

        let keys = self.requested.lock().remove(&node).unwrap_or_default();
        self.fail(TxError::Topology { node, keys });
        true
    }

    fn on_response(&self, _sender: NodeId, message: &Message) {
        let Message::LockResponse(res) = message else {
            return;
        };
        if let Some(mini) = self.minis.find(res.ctx.mini_id) {
            self.on_lock_response(&mini, res);
        }
    }

    fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}
