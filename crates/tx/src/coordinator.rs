//! Entry point for transactions started on this node.

use crate::config::TxConfig;
use crate::dht::TxParticipant;
use crate::error::Result;
use crate::finish::{FinishFuture, FinishOutcome};
use crate::lock::LockFuture;
use crate::lock_mapping::LockMapper;
use crate::prepare::PrepareFuture;
use crate::registry::{ActiveTxRegistry, FutureRegistry};
use crate::transaction::{NearTx, TxOptions};
use gridcore_common::{
    Affinity, CacheKey, EntryStore, NodeEvent, NodeId, Subscription, TopologyProvider, TxVersion,
    VersionClock,
};
use gridcore_messaging::{Listener, Messaging};
use gridcore_protocol::{Message, Topic};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// State shared by the coordinator and the futures it creates
pub(crate) struct TxShared {
    pub(crate) local: NodeId,
    pub(crate) messaging: Messaging,
    pub(crate) affinity: Arc<dyn Affinity>,
    pub(crate) participant: Arc<TxParticipant>,
    /// Near copies of values this node does not own
    pub(crate) near_store: Arc<dyn EntryStore>,
    pub(crate) futures: FutureRegistry,
    pub(crate) active: ActiveTxRegistry,
}

/// Starts transactions and drives their lock, prepare and finish phases.
pub struct TxCoordinator {
    shared: Arc<TxShared>,
    config: TxConfig,
    clock: Arc<VersionClock>,
    mapper: LockMapper,
    subscription: Mutex<Option<Subscription>>,
}

impl TxCoordinator {
    pub fn new(
        config: TxConfig,
        messaging: Messaging,
        affinity: Arc<dyn Affinity>,
        participant: Arc<TxParticipant>,
        near_store: Arc<dyn EntryStore>,
        clock: Arc<VersionClock>,
    ) -> Self {
        Self {
            mapper: LockMapper::new(affinity.clone()),
            shared: Arc::new(TxShared {
                local: messaging.local_node_id(),
                messaging,
                affinity,
                participant,
                near_store,
                futures: FutureRegistry::default(),
                active: ActiveTxRegistry::default(),
            }),
            config,
            clock,
            subscription: Mutex::new(None),
        }
    }

    /// Register for responses and membership changes.
    pub fn start(&self, topology: &dyn TopologyProvider) {
        self.shared
            .messaging
            .add_listener(Topic::Cache, self.response_listener());

        let shared = Arc::downgrade(&self.shared);
        let subscription = topology.subscribe(Arc::new(move |event: &NodeEvent| {
            if event.is_departure()
                && let Some(shared) = shared.upgrade()
            {
                Self::on_node_left(&shared, event.node().id);
            }
        }));
        *self.subscription.lock() = Some(subscription);
    }

    /// Drop the membership subscription
    pub fn stop(&self) {
        self.subscription.lock().take();
    }

    fn response_listener(&self) -> Listener {
        let shared: Weak<TxShared> = Arc::downgrade(&self.shared);
        Arc::new(move |sender: NodeId, message: &Message| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let future_id = match message {
                Message::LockResponse(res) => res.ctx.future_id,
                Message::PrepareResponse(res) => res.ctx.future_id,
                Message::FinishResponse(res) => res.ctx.future_id,
                _ => return,
            };
            match shared.futures.get(future_id) {
                Some(future) => future.on_response(sender, message),
                None => tracing::debug!(
                    node = %sender,
                    future = %future_id,
                    "response for unknown or completed future (will ignore)"
                ),
            }
        })
    }

    fn on_node_left(shared: &TxShared, node: NodeId) {
        let futures = shared.futures.on_node_left(node);
        let orphans = shared.participant.on_node_left(node);
        if futures > 0 || orphans > 0 {
            tracing::debug!(node = %node, futures, orphans, "processed node departure");
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.shared.local
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Options with this node's defaults
    pub fn default_options(&self) -> TxOptions {
        TxOptions::from_config(&self.config)
    }

    /// Start a transaction with a fresh version.
    pub fn begin(&self, options: TxOptions) -> Arc<NearTx> {
        let tx = Arc::new(NearTx::new(self.clock.next(), options));
        self.shared.active.add(tx.clone());
        tracing::trace!(tx = %tx.version(), "transaction started");
        tx
    }

    /// Lock `keys` on their primaries for `tx`.
    pub fn lock(&self, tx: &Arc<NearTx>, keys: Vec<CacheKey>) -> Arc<LockFuture> {
        let future = LockFuture::new(tx.clone(), self.shared.clone(), keys);
        future.start(&self.mapper);
        future
    }

    /// Prepare without committing: every owner stages the writes and keeps
    /// its locks until [`finish`](Self::finish).
    pub fn prepare(&self, tx: &Arc<NearTx>) -> Arc<PrepareFuture> {
        self.start_prepare(tx, false)
    }

    fn start_prepare(&self, tx: &Arc<NearTx>, commit_on_single_owner: bool) -> Arc<PrepareFuture> {
        let future = PrepareFuture::new(tx.clone(), self.shared.clone(), commit_on_single_owner);
        future.start();
        future
    }

    pub fn finish(&self, tx: &Arc<NearTx>, commit: bool) -> Arc<FinishFuture> {
        let future = FinishFuture::new(tx.clone(), self.shared.clone(), commit);
        future.start();
        future
    }

    /// Prepare, then commit; a failed prepare rolls back and reports the
    /// prepare error. A transaction owned by a single node commits in one
    /// phase.
    pub async fn commit(&self, tx: &Arc<NearTx>) -> Result<FinishOutcome> {
        if let Err(e) = self.start_prepare(tx, true).wait().await {
            if let Err(rollback) = self.finish(tx, false).wait().await {
                tracing::warn!(tx = %tx.version(), "rollback after failed prepare failed: {}", rollback);
            }
            return Err(e);
        }
        self.finish(tx, true).wait().await
    }

    pub async fn rollback(&self, tx: &Arc<NearTx>) -> Result<FinishOutcome> {
        self.finish(tx, false).wait().await
    }

    pub fn mapper(&self) -> &LockMapper {
        &self.mapper
    }

    pub fn transaction(&self, version: &TxVersion) -> Option<Arc<NearTx>> {
        self.shared.active.get(version)
    }

    /// Transactions started here and not finished
    pub fn active_count(&self) -> usize {
        self.shared.active.len()
    }

    /// Lock, prepare and finish futures still in flight
    pub fn pending_futures(&self) -> usize {
        self.shared.futures.len()
    }

    pub fn participant(&self) -> &Arc<TxParticipant> {
        &self.shared.participant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::LockResult;
    use crate::error::TxError;
    use crate::transaction::TxState;
    use gridcore_common::{CacheValue, Cluster, LocalTopology, MemoryStore, RendezvousAffinity};
    use gridcore_messaging::{LocalNetwork, MessagingConfig};
    use gridcore_protocol::RemoteError;
    use std::time::Duration;

    struct Node {
        coordinator: TxCoordinator,
        affinity: Arc<dyn Affinity>,
        store: Arc<MemoryStore>,
        _topology: Arc<LocalTopology>,
    }

    fn node(cluster: &Arc<Cluster>, network: &Arc<LocalNetwork>, backups: usize) -> Node {
        let id = NodeId::random();
        let topology = cluster.join(id);
        let messaging =
            Messaging::new(MessagingConfig::for_testing(), topology.clone(), network.transport(id))
                .unwrap();
        network.register(id, Arc::new(messaging.clone()));

        let affinity: Arc<dyn Affinity> = Arc::new(RendezvousAffinity::new(topology.clone(), 16, backups));
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(VersionClock::new(id));
        let participant = Arc::new(TxParticipant::new(
            messaging.clone(),
            affinity.clone(),
            store.clone(),
            clock.clone(),
            64,
        ));
        messaging.add_listener(Topic::Cache, participant.listener());

        let coordinator = TxCoordinator::new(
            TxConfig::for_testing(),
            messaging.clone(),
            affinity.clone(),
            participant,
            Arc::new(MemoryStore::new()),
            clock,
        );
        coordinator.start(topology.as_ref());
        messaging.start();

        Node {
            coordinator,
            affinity,
            store,
            _topology: topology,
        }
    }

    async fn bounded<T>(f: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), f)
            .await
            .expect("operation timed out")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_node_commit_is_one_phase() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 0);

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        tx.put("k", "v").unwrap();

        let outcome = bounded(a.coordinator.commit(&tx)).await.unwrap();
        assert!(outcome.committed);
        assert!(outcome.nodes.is_empty());
        assert!(tx.one_phase_commit());
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(a.store.value(&CacheKey::from("k")), Some(CacheValue::from("v")));
        assert_eq!(a.coordinator.active_count(), 0);
        assert_eq!(a.coordinator.pending_futures(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_node_commit() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 1);
        let b = node(&cluster, &network, 1);

        let tx = a.coordinator.begin(TxOptions::optimistic());
        tx.put("x", "1").unwrap();
        tx.put("y", "2").unwrap();

        let outcome = bounded(a.coordinator.commit(&tx)).await.unwrap();
        assert_eq!(outcome.nodes.len(), 2);
        for n in [&a, &b] {
            assert_eq!(n.store.value(&CacheKey::from("x")), Some(CacheValue::from("1")));
            assert_eq!(n.store.value(&CacheKey::from("y")), Some(CacheValue::from("2")));
            assert!(n.coordinator.participant().locks().is_empty());
        }
        assert_eq!(a.coordinator.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_conflict_fails_and_marks_rollback() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 1);
        let _b = node(&cluster, &network, 1);

        let first = a.coordinator.begin(TxOptions::pessimistic());
        first.put("k", "1").unwrap();
        bounded(a.coordinator.prepare(&first).wait()).await.unwrap();

        let second = a.coordinator.begin(TxOptions::pessimistic());
        second.put("k", "2").unwrap();
        let err = bounded(a.coordinator.commit(&second)).await.unwrap_err();
        assert!(matches!(
            err,
            TxError::Prepare {
                cause: RemoteError::LockConflict { holder, .. },
                ..
            } if holder == first.version()
        ));
        assert!(second.is_rollback_only());
        assert_eq!(second.state(), TxState::RolledBack);

        bounded(a.coordinator.finish(&first, true).wait()).await.unwrap();
        assert_eq!(a.coordinator.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_alone_keeps_single_owner_locks() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 0);
        let key = CacheKey::from("k");

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        tx.put(key.clone(), "v").unwrap();
        bounded(a.coordinator.prepare(&tx).wait()).await.unwrap();
        assert!(!tx.one_phase_commit());
        assert_eq!(a.store.value(&key), None);
        assert_eq!(a.coordinator.participant().locks().holder(&key), Some(tx.version()));

        let outcome = bounded(a.coordinator.rollback(&tx)).await.unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.nodes, vec![a.coordinator.local_node_id()]);
        assert_eq!(a.store.value(&key), None);
        assert!(a.coordinator.participant().locks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_local_prepare_failure_stops_remote_requests() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 1);
        let b = node(&cluster, &network, 1);
        let local = a.coordinator.local_node_id();

        // Local node first in the mapping, so it is prepared before the backup
        let topology_version = a.affinity.topology_version();
        let key = (0..)
            .map(|i| CacheKey::from(format!("key-{i}")))
            .find(|k| a.affinity.primary(k, topology_version) == Some(local))
            .unwrap();

        let holder = TxVersion::new(1, 0, local);
        assert_eq!(
            a.coordinator.participant().locks().try_lock_all(holder, [&key]),
            LockResult::Granted
        );

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        tx.put(key.clone(), "v").unwrap();
        let err = bounded(a.coordinator.prepare(&tx).wait()).await.unwrap_err();
        assert!(matches!(
            err,
            TxError::Prepare {
                cause: RemoteError::LockConflict { .. },
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.coordinator.participant().locks().is_empty());
        assert_eq!(b.coordinator.participant().active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_explicit_lock_then_commit() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 1);
        let _b = node(&cluster, &network, 1);
        let key = CacheKey::from("locked");

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        bounded(a.coordinator.lock(&tx, vec![key.clone()]).wait()).await.unwrap();
        assert!(tx.has_explicit_lock(&key));
        assert_eq!(tx.lock_nodes().len(), 1);

        let other = a.coordinator.begin(TxOptions::pessimistic());
        let err = bounded(a.coordinator.lock(&other, vec![key.clone()]).wait())
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Lock { cause: RemoteError::LockConflict { .. }, .. }));
        bounded(a.coordinator.rollback(&other)).await.unwrap();

        tx.put(key.clone(), "v").unwrap();
        bounded(a.coordinator.commit(&tx)).await.unwrap();
        assert!(tx.mappings().iter().any(|m| m.explicit_lock));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rollback_releases_explicit_locks() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 0);
        let b = node(&cluster, &network, 0);

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        let keys: Vec<CacheKey> = (0..8).map(|i| CacheKey::from(format!("key-{i}"))).collect();
        bounded(a.coordinator.lock(&tx, keys).wait()).await.unwrap();

        let outcome = bounded(a.coordinator.rollback(&tx)).await.unwrap();
        assert!(!outcome.committed);
        assert_eq!(tx.state(), TxState::RolledBack);
        for n in [&a, &b] {
            assert!(n.coordinator.participant().locks().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rollback_only_commit_fails() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 0);

        let tx = a.coordinator.begin(TxOptions::pessimistic());
        tx.put("k", "v").unwrap();
        tx.set_rollback_only();

        let err = bounded(a.coordinator.commit(&tx)).await.unwrap_err();
        assert!(matches!(err, TxError::Rollback(_)));
        assert_eq!(a.store.value(&CacheKey::from("k")), None);
        assert_eq!(a.coordinator.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_pessimistic_prepare_does_not_wait() {
        let cluster = Cluster::new();
        let network = LocalNetwork::new();
        let a = node(&cluster, &network, 1);
        let b = node(&cluster, &network, 1);

        let tx = a
            .coordinator
            .begin(TxOptions::pessimistic().with_sync_commit(false));
        tx.put("k", "v").unwrap();

        // The remote owner never answers, prepare still completes
        network.block(b.coordinator.local_node_id());
        bounded(a.coordinator.prepare(&tx).wait()).await.unwrap();
        network.unblock(b.coordinator.local_node_id());

        bounded(a.coordinator.finish(&tx, true).wait()).await.unwrap();
        assert_eq!(a.store.value(&CacheKey::from("k")), Some(CacheValue::from("v")));
    }
}
