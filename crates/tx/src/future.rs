//! Completion primitives shared by the aggregate futures.

use crate::error::{Result, TxError};
use gridcore_common::{MiniId, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Write-once result cell that any number of tasks can await.
pub struct Completion<T> {
    tx: watch::Sender<Option<Result<T>>>,
}

impl<T: Clone + Send + Sync> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store the result; returns false if one was already stored.
    pub fn complete(&self, result: Result<T>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn result(&self) -> Option<Result<T>> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(TxError::Cancelled)),
            Err(_) => Err(TxError::Cancelled),
        }
    }
}

impl<T: Clone + Send + Sync> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion handle for the request sent to one node.
#[derive(Debug)]
pub struct MiniFuture {
    id: MiniId,
    node: NodeId,
    resolved: AtomicBool,
}

impl MiniFuture {
    pub fn new(node: NodeId) -> Self {
        Self {
            id: MiniId::new(),
            node,
            resolved: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> MiniId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Resolve once; a second call is reported as an error.
    pub fn resolve(&self) -> Result<()> {
        self.resolved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| TxError::MiniAlreadyResolved(self.id))
    }
}

/// Mini futures owned by one aggregate future
#[derive(Default)]
pub(crate) struct MiniFutures {
    minis: Mutex<Vec<Arc<MiniFuture>>>,
}

impl MiniFutures {
    pub(crate) fn add(&self, node: NodeId) -> Arc<MiniFuture> {
        let mini = Arc::new(MiniFuture::new(node));
        self.minis.lock().push(mini.clone());
        mini
    }

    pub(crate) fn find(&self, id: MiniId) -> Option<Arc<MiniFuture>> {
        self.minis.lock().iter().find(|m| m.id() == id).cloned()
    }

    /// Outstanding minis addressed to `node`
    pub(crate) fn unresolved_for(&self, node: NodeId) -> Vec<Arc<MiniFuture>> {
        self.minis
            .lock()
            .iter()
            .filter(|m| m.node() == node && !m.is_resolved())
            .cloned()
            .collect()
    }

    pub(crate) fn all_resolved(&self) -> bool {
        self.minis.lock().iter().all(|m| m.is_resolved())
    }

    pub(crate) fn len(&self) -> usize {
        self.minis.lock().len()
    }
}
