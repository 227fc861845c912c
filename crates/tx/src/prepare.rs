//! Prepare phase of a near transaction.
//!
//! One mini future per mapped node. A local destination is served directly
//! by the local participant; remote ones get a prepare request on the cache
//! topic. The aggregate completes once every mini future resolved, or at the
//! first definitive failure.

use crate::coordinator::TxShared;
use crate::error::{Result, TxError};
use crate::future::{Completion, MiniFuture, MiniFutures};
use crate::mapping::{TxMapping, TxMappings};
use crate::registry::TxFuture;
use crate::transaction::{NearTx, TxState};
use gridcore_common::{CacheKey, FutureId, NodeId, TxVersion};
use gridcore_protocol::{
    IoPolicy, Message, OwnedValue, PrepareRequest, PrepareResponse, RemoteError, Topic, TxContext,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What the participants reported back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareOutcome {
    /// Versions of older active transactions, deduplicated and sorted
    pub pending: Vec<TxVersion>,
    /// Partitions each node no longer owns; their keys need remapping
    pub invalid_partitions: BTreeMap<NodeId, Vec<u32>>,
    pub owned_values: Vec<OwnedValue>,
    /// Nodes that left before answering; their mappings were dropped
    pub dropped_nodes: Vec<NodeId>,
}

pub struct PrepareFuture {
    id: FutureId,
    tx: Arc<NearTx>,
    shared: Arc<TxShared>,
    /// Prepare runs as the first half of a commit; a single owner may
    /// commit on the spot
    commit_on_single_owner: bool,
    minis: MiniFutures,
    /// All requests have been dispatched
    initialized: AtomicBool,
    outcome: Mutex<PrepareOutcome>,
    completion: Completion<PrepareOutcome>,
}

impl PrepareFuture {
    pub(crate) fn new(
        tx: Arc<NearTx>,
        shared: Arc<TxShared>,
        commit_on_single_owner: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: FutureId::new(),
            tx,
            shared,
            commit_on_single_owner,
            minis: MiniFutures::default(),
            initialized: AtomicBool::new(false),
            outcome: Mutex::new(PrepareOutcome::default()),
            completion: Completion::new(),
        })
    }

    pub fn tx(&self) -> &Arc<NearTx> {
        &self.tx
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub fn result(&self) -> Option<Result<PrepareOutcome>> {
        self.completion.result()
    }

    pub async fn wait(&self) -> Result<PrepareOutcome> {
        self.completion.wait().await
    }

    pub(crate) fn start(self: &Arc<Self>) {
        if self.tx.is_rollback_only() {
            self.fail(TxError::Rollback("transaction is marked rollback-only".into()));
            return;
        }
        if let Err(e) = self.tx.transition(TxState::Preparing) {
            self.fail(e);
            return;
        }

        let topology_version = self.shared.affinity.topology_version();
        let mappings = match TxMappings::build(&self.tx, self.shared.affinity.as_ref(), topology_version)
        {
            Ok(mappings) => mappings,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let one_phase = self.commit_on_single_owner && mappings.len() == 1;
        self.tx.set_one_phase_commit(one_phase);
        self.tx.set_mappings(mappings.clone(), topology_version);
        self.shared.futures.add(self.clone());

        // Waiting is pointless when the finish request carries the writes anyway
        let fire_and_forget = !self.tx.options().sync_commit && self.tx.is_pessimistic();

        for mapping in mappings.iter() {
            let mini = self.minis.add(mapping.node);
            let req = PrepareRequest {
                ctx: TxContext {
                    version: self.tx.version(),
                    future_id: self.id,
                    mini_id: mini.id(),
                },
                thread_id: self.tx.thread_id(),
                topology_version,
                concurrency: self.tx.concurrency(),
                explicit_lock: mapping.explicit_lock,
                partition_lock: false,
                one_phase_commit: one_phase,
                reads: mapping.reads.clone(),
                writes: mapping.writes.clone(),
            };

            if mapping.node == self.shared.local {
                let res = self.shared.participant.handle_prepare(self.shared.local, &req);
                self.on_prepare_response(&mini, &res);
            } else {
                tracing::trace!(tx = %self.tx.version(), node = %mapping.node, "sending prepare request");
                match self.shared.messaging.send(
                    mapping.node,
                    Topic::Cache,
                    Message::PrepareRequest(req),
                    IoPolicy::System,
                ) {
                    Ok(()) => {
                        if fire_and_forget && !mapping.explicit_lock {
                            // The finish of a commit has to learn the result
                            self.tx.set_prepare_unconfirmed();
                            let _ = mini.resolve();
                        }
                    }
                    Err(e) if e.is_topology() => {
                        self.on_node_left(mapping.node);
                    }
                    Err(e) => {
                        self.fail(e.into());
                    }
                }
            }

            if self.completion.is_done() {
                return;
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.check_complete();
    }

    fn on_prepare_response(&self, mini: &MiniFuture, res: &PrepareResponse) {
        let node = mini.node();

        if mini.resolve().is_err() {
            // Already resolved on send or by node departure
            if let Some(cause) = &res.error {
                tracing::warn!(
                    tx = %self.tx.version(),
                    node = %node,
                    "late prepare failure, marking transaction rollback-only: {}",
                    cause
                );
                self.tx.set_rollback_only();
            }
            return;
        }

        if let Some(cause) = &res.error {
            let error = match cause {
                RemoteError::Heuristic(message) => TxError::Heuristic {
                    node,
                    message: message.clone(),
                },
                cause => TxError::Prepare {
                    node,
                    cause: cause.clone(),
                },
            };
            self.fail(error);
            return;
        }

        let version = self.tx.version();
        {
            let mut outcome = self.outcome.lock();
            for pending in res.pending.iter().filter(|v| **v < version) {
                if !outcome.pending.contains(pending) {
                    outcome.pending.push(*pending);
                }
            }
            outcome.pending.sort();

            if !res.invalid_partitions.is_empty() {
                tracing::debug!(
                    tx = %version,
                    node = %node,
                    partitions = ?res.invalid_partitions,
                    "node no longer owns some partitions"
                );
                outcome
                    .invalid_partitions
                    .entry(node)
                    .or_default()
                    .extend(res.invalid_partitions.iter().copied());
            }

            outcome.owned_values.extend(res.owned_values.iter().cloned());
        }

        for owned in &res.owned_values {
            if let Err(e) =
                self.shared
                    .near_store
                    .write(&owned.key, owned.value.clone(), owned.version, None)
            {
                tracing::warn!(key = %owned.key, "failed to apply owned value to near cache: {}", e);
            }
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

        if let Err(e) = self.tx.transition(TxState::Prepared) {
            self.fail(e);
            return;
        }

        let outcome = self.outcome.lock().clone();
        if self.completion.complete(Ok(outcome)) {
            self.shared.futures.remove(self.id);
            tracing::debug!(tx = %self.tx.version(), "transaction prepared");
        }
    }

    fn fail(&self, error: TxError) {
        self.tx.set_rollback_only();
        self.tx.set_commit_error(error.clone());

        tracing::debug!(tx = %self.tx.version(), "prepare failed: {}", error);
        if self.completion.complete(Err(error)) {
            self.shared.futures.remove(self.id);
        }
    }

    /// Keys of `node`'s dropped mapping held by no other mapping
    fn lost_keys(&self, dropped: &TxMapping) -> Vec<CacheKey> {
        let remaining = self.tx.mappings();
        let mut lost: Vec<CacheKey> = Vec::new();
        for key in dropped.keys() {
            if !remaining.contains_key(key) && !lost.contains(key) {
                lost.push(key.clone());
            }
        }
        lost
    }
}

impl TxFuture for PrepareFuture {
    fn future_id(&self) -> FutureId {
        self.id
    }

    fn on_node_left(&self, node: NodeId) -> bool {
        let waiting = self.minis.unresolved_for(node);
        if waiting.is_empty() {
            return false;
        }

        tracing::debug!(tx = %self.tx.version(), node = %node, "node left during prepare, dropping its mapping");
        for mini in &waiting {
            let _ = mini.resolve();
        }
        self.outcome.lock().dropped_nodes.push(node);

        if let Some(dropped) = self.tx.remove_mapping(node) {
            let lost = self.lost_keys(&dropped);
            if !lost.is_empty() {
                self.fail(TxError::Topology { node, keys: lost });
                return true;
            }
        }

        self.tx.set_one_phase_commit(false);
        self.check_complete();
        true
    }

    fn on_response(&self, _sender: NodeId, message: &Message) {
        let Message::PrepareResponse(res) = message else {
            return;
        };

        match self.minis.find(res.ctx.mini_id) {
            Some(mini) => self.on_prepare_response(&mini, res),
            None => tracing::debug!(
                tx = %self.tx.version(),
                mini = %res.ctx.mini_id,
                "prepare response for unknown mini future"
            ),
        }
    }

    fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}
