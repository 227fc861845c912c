//! Registries of in-flight futures and active transactions.

use crate::transaction::NearTx;
use dashmap::DashMap;
use gridcore_common::{FutureId, NodeId, TxVersion};
use gridcore_protocol::Message;
use std::sync::Arc;

/// An aggregate future that receives responses and membership changes.
pub trait TxFuture: Send + Sync {
    fn future_id(&self) -> FutureId;

    /// A node left; returns true if the future was waiting on it
    fn on_node_left(&self, node: NodeId) -> bool;

    /// A response correlated to this future arrived from `sender`
    fn on_response(&self, sender: NodeId, message: &Message);

    fn is_done(&self) -> bool;
}

/// In-flight futures by id
#[derive(Default)]
pub struct FutureRegistry {
    futures: DashMap<FutureId, Arc<dyn TxFuture>>,
}

impl FutureRegistry {
    pub fn add(&self, future: Arc<dyn TxFuture>) {
        self.futures.insert(future.future_id(), future);
    }

    pub fn remove(&self, id: FutureId) -> bool {
        self.futures.remove(&id).is_some()
    }

    pub fn get(&self, id: FutureId) -> Option<Arc<dyn TxFuture>> {
        self.futures.get(&id).map(|f| f.value().clone())
    }

    /// Notify every registered future; returns how many were affected.
    pub fn on_node_left(&self, node: NodeId) -> usize {
        // Callbacks may unregister futures
        let futures: Vec<Arc<dyn TxFuture>> =
            self.futures.iter().map(|f| f.value().clone()).collect();

        futures
            .into_iter()
            .filter(|future| future.on_node_left(node))
            .count()
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

/// Transactions started on this node and not yet finished
#[derive(Default)]
pub struct ActiveTxRegistry {
    txs: DashMap<TxVersion, Arc<NearTx>>,
}

impl ActiveTxRegistry {
    pub fn add(&self, tx: Arc<NearTx>) {
        self.txs.insert(tx.version(), tx);
    }

    pub fn get(&self, version: &TxVersion) -> Option<Arc<NearTx>> {
        self.txs.get(version).map(|t| t.value().clone())
    }

    /// Returns true only for the call that actually removed the transaction
    pub fn remove(&self, version: &TxVersion) -> bool {
        self.txs.remove(version).is_some()
    }

    pub fn contains(&self, version: &TxVersion) -> bool {
        self.txs.contains_key(version)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
