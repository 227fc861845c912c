//! Commit or rollback of a near transaction.

use crate::coordinator::TxShared;
use crate::error::{Result, TxError};
use crate::future::{Completion, MiniFuture, MiniFutures};
use crate::registry::TxFuture;
use crate::transaction::{NearTx, TxState};
use gridcore_common::{FutureId, NodeId};
use gridcore_protocol::{
    FinishRequest, FinishResponse, IoPolicy, Message, RemoteError, Topic, TxContext,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How a finish ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOutcome {
    pub committed: bool,
    /// Nodes a finish request was sent to
    pub nodes: Vec<NodeId>,
    /// Nodes that left before answering
    pub dropped_nodes: Vec<NodeId>,
}

#[derive(Default)]
struct FinishProgress {
    nodes: Vec<NodeId>,
    dropped_nodes: Vec<NodeId>,
    error: Option<TxError>,
}

pub struct FinishFuture {
    id: FutureId,
    tx: Arc<NearTx>,
    shared: Arc<TxShared>,
    /// Commit was requested and the transaction allowed it
    commit: bool,
    /// Commit was requested but the transaction could only roll back
    forced_rollback: bool,
    minis: MiniFutures,
    initialized: AtomicBool,
    progress: Mutex<FinishProgress>,
    completion: Completion<FinishOutcome>,
}

impl FinishFuture {
    pub(crate) fn new(tx: Arc<NearTx>, shared: Arc<TxShared>, commit: bool) -> Arc<Self> {
        let forced_rollback = commit && tx.is_rollback_only();
        Arc::new(Self {
            id: FutureId::new(),
            commit: commit && !forced_rollback,
            forced_rollback,
            tx,
            shared,
            minis: MiniFutures::default(),
            initialized: AtomicBool::new(false),
            progress: Mutex::new(FinishProgress::default()),
            completion: Completion::new(),
        })
    }

    pub fn tx(&self) -> &Arc<NearTx> {
        &self.tx
    }

    pub fn is_commit(&self) -> bool {
        self.commit
    }

    /// Nodes a finish request was sent to so far
    pub fn nodes(&self) -> Vec<NodeId> {
        self.progress.lock().nodes.clone()
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub fn result(&self) -> Option<Result<FinishOutcome>> {
        self.completion.result()
    }

    pub async fn wait(&self) -> Result<FinishOutcome> {
        self.completion.wait().await
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let target = if self.commit {
            TxState::Committing
        } else {
            TxState::RollingBack
        };
        if let Err(e) = self.tx.transition(target) {
            // Nothing was sent; the transaction stays registered
            self.completion.complete(Err(e));
            return;
        }

        // Everything was decided on the single owner during prepare
        if self.tx.one_phase_commit() {
            tracing::debug!(tx = %self.tx.version(), "one-phase transaction, skipping finish requests");
            self.initialized.store(true, Ordering::SeqCst);
            self.check_complete();
            return;
        }

        self.shared.futures.add(self.clone());

        // A commit whose prepare went unanswered waits for the owners, since
        // a refused write only shows up in the finish response
        let sync = if self.commit {
            self.tx.options().sync_commit || self.tx.prepare_unconfirmed()
        } else {
            self.tx.options().sync_rollback
        };
        let topology_version = self
            .tx
            .topology_version()
            .unwrap_or_else(|| self.shared.affinity.topology_version());
        let tx_size = self.tx.size();

        for mapping in self.tx.finish_mappings().iter() {
            let mini = self.minis.add(mapping.node);
            let writes = (self.commit && self.tx.is_pessimistic()).then(|| mapping.writes.clone());
            let req = FinishRequest {
                ctx: TxContext {
                    version: self.tx.version(),
                    future_id: self.id,
                    mini_id: mini.id(),
                },
                thread_id: self.tx.thread_id(),
                commit: self.commit,
                invalidate: self.tx.options().invalidate,
                explicit_lock: mapping.explicit_lock,
                topology_version,
                tx_size,
                writes,
                sync,
            };
            self.progress.lock().nodes.push(mapping.node);

            if mapping.node == self.shared.local {
                let res = self.shared.participant.handle_finish(self.shared.local, &req);
                self.on_finish_response(&mini, &res);
                continue;
            }

            tracing::trace!(tx = %self.tx.version(), node = %mapping.node, commit = self.commit, "sending finish request");
            match self.shared.messaging.send(
                mapping.node,
                Topic::Cache,
                Message::FinishRequest(req),
                IoPolicy::System,
            ) {
                Ok(()) => {
                    if !sync && !mapping.explicit_lock {
                        let _ = mini.resolve();
                    }
                }
                Err(e) if e.is_topology() => {
                    self.on_node_left(mapping.node);
                }
                Err(e) => {
                    let _ = mini.resolve();
                    self.record_error(e.into());
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.check_complete();
    }

    fn on_finish_response(&self, mini: &MiniFuture, res: &FinishResponse) {
        let first = mini.resolve().is_ok();
        if !first {
            tracing::trace!(tx = %self.tx.version(), node = %mini.node(), "finish response for resolved mini future");
        }

        if let Some(cause) = &res.error {
            self.on_error(mini.node(), cause.clone());
        }

        if first {
            self.check_complete();
        }
    }

    fn on_error(&self, node: NodeId, cause: RemoteError) {
        self.tx.set_rollback_only();

        match cause {
            RemoteError::Heuristic(message) => {
                tracing::error!(
                    tx = %self.tx.version(),
                    node = %node,
                    "heuristic failure during finish, transaction outcome is unknown: {}",
                    message
                );
                let error = TxError::Heuristic { node, message };
                self.tx.set_commit_error(error.clone());
                self.record_error(error);

                let options = self.tx.options();
                if options.implicit && options.system_invalidate {
                    self.tx.close();
                }
                self.invalidate_near_entries();
            }
            cause => self.record_error(TxError::Finish { node, cause }),
        }
    }

    fn record_error(&self, error: TxError) {
        let mut progress = self.progress.lock();
        let replace = match &progress.error {
            None => true,
            Some(current) => !current.is_heuristic() && error.is_heuristic(),
        };
        if replace {
            progress.error = Some(error);
        }
    }

    /// Drop near copies of written keys this node does not own; their
    /// committed state is unknown.
    fn invalidate_near_entries(&self) {
        let version = self.tx.version();
        for key in self.tx.write_keys() {
            if self.shared.affinity.current_nodes(&key).contains(&self.shared.local) {
                continue;
            }
            if let Some(entry) = self.shared.near_store.peek(&key)
                && entry.invalidate(version)
            {
                tracing::debug!(tx = %version, key = %key, "invalidated near entry");
            }
        }
    }

    fn check_complete(&self) {
        if !self.initialized.load(Ordering::SeqCst) || !self.minis.all_resolved() {
            return;
        }

        let result = {
            let progress = self.progress.lock();
            match &progress.error {
                Some(error) => Err(error.clone()),
                None if self.forced_rollback => Err(TxError::Rollback(
                    "transaction was marked rollback-only".into(),
                )),
                None => Ok(FinishOutcome {
                    committed: self.commit,
                    nodes: progress.nodes.clone(),
                    dropped_nodes: progress.dropped_nodes.clone(),
                }),
            }
        };

        self.complete(result);
    }

    fn complete(&self, result: Result<FinishOutcome>) {
        let state = match &result {
            Ok(outcome) if outcome.committed => TxState::Committed,
            Ok(_) => TxState::RolledBack,
            Err(e) if e.is_heuristic() => TxState::Unknown,
            Err(_) if self.commit => TxState::Unknown,
            Err(_) => TxState::RolledBack,
        };

        if !self.completion.complete(result) {
            return;
        }

        if let Err(e) = self.tx.transition(state) {
            tracing::debug!(tx = %self.tx.version(), "final state not applied: {}", e);
        }
        self.shared.futures.remove(self.id);
        if self.shared.active.remove(&self.tx.version()) {
            tracing::debug!(tx = %self.tx.version(), state = ?state, "transaction finished");
        }
    }
}

impl TxFuture for FinishFuture {
    fn future_id(&self) -> FutureId {
        self.id
    }

    fn on_node_left(&self, node: NodeId) -> bool {
        let waiting = self.minis.unresolved_for(node);
        if waiting.is_empty() {
            return false;
        }

        tracing::debug!(tx = %self.tx.version(), node = %node, "node left before finish response, treating its part as finished");
        self.tx.remove_mapping(node);
        self.progress.lock().dropped_nodes.push(node);
        for mini in &waiting {
            let _ = mini.resolve();
        }

        self.check_complete();
        true
    }

    fn on_response(&self, _sender: NodeId, message: &Message) {
        let Message::FinishResponse(res) = message else {
            return;
        };

        match self.minis.find(res.ctx.mini_id) {
            Some(mini) => self.on_finish_response(&mini, res),
            None => tracing::debug!(
                tx = %self.tx.version(),
                mini = %res.ctx.mini_id,
                "finish response for unknown mini future"
            ),
        }
    }

    fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}
