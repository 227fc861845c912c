mod common;

use common::{TestGrid, bounded, key_with_owners};
use gridcore::GridConfig;
use gridcore::common::{
    CacheEntry, CacheKey, CacheValue, EntryStore, MemoryStore, StorageError, TxVersion,
    UpdateOutcome,
};
use gridcore::protocol::RemoteError;
use gridcore::tx::{TxError, TxOptions, TxState};
use gridcore::{GridNode, messaging::LocalNetwork};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pessimistic_commit_reaches_primary_and_backup() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let (p, b, n) = (grid.node(0), grid.node(1), grid.node(2));
    let key = key_with_owners(n, &[p.id(), b.id()]);

    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "committed").unwrap();

    let outcome = bounded(n.transactions().commit(&tx)).await.unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.nodes, vec![p.id(), b.id()]);
    assert!(outcome.dropped_nodes.is_empty());
    assert_eq!(tx.state(), TxState::Committed);

    let expected = Some(CacheValue::from("committed"));
    assert_eq!(p.store().value(&key), expected);
    assert_eq!(b.store().value(&key), expected);
    assert_eq!(
        p.store().peek(&key).unwrap().version(),
        b.store().peek(&key).unwrap().version()
    );
    assert!(n.store().peek(&key).is_none());

    for node in &grid.nodes {
        assert!(node.participant().locks().is_empty());
        assert_eq!(node.transactions().pending_futures(), 0);
    }
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backup_leaving_during_prepare_is_dropped() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let (p, b, n) = (grid.node(0), grid.node(1), grid.node(2));
    let key = key_with_owners(n, &[p.id(), b.id()]);

    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "v").unwrap();

    // B receives nothing and never answers
    grid.network.block(b.id());
    let prepare = n.transactions().prepare(&tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!prepare.is_done());

    grid.cluster.fail(b.id());
    let outcome = bounded(prepare.wait()).await.unwrap();
    assert_eq!(outcome.dropped_nodes, vec![b.id()]);
    assert_eq!(tx.state(), TxState::Prepared);
    assert!(tx.mappings().get(b.id()).is_none());
    assert!(tx.mappings().contains_key(&key));

    let finish = bounded(n.transactions().finish(&tx, true).wait())
        .await
        .unwrap();
    assert_eq!(finish.nodes, vec![p.id()]);
    assert_eq!(p.store().value(&key), Some(CacheValue::from("v")));
    assert_eq!(tx.state(), TxState::Committed);

    grid.network.unblock(b.id());
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_leaving_during_finish_is_dropped() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let (p, b, n) = (grid.node(0), grid.node(1), grid.node(2));
    let key = key_with_owners(n, &[p.id(), b.id()]);

    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "v").unwrap();
    bounded(n.transactions().prepare(&tx).wait()).await.unwrap();

    // B was prepared but never sees the finish request
    grid.network.block(b.id());
    let finish = n.transactions().finish(&tx, true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!finish.is_done());
    assert_eq!(n.transactions().active_count(), 1);

    grid.cluster.fail(b.id());
    let outcome = bounded(finish.wait()).await.unwrap();
    assert!(outcome.committed);
    assert_eq!(outcome.nodes, vec![p.id(), b.id()]);
    assert_eq!(outcome.dropped_nodes, vec![b.id()]);
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(n.transactions().active_count(), 0);
    assert_eq!(n.transactions().pending_futures(), 0);
    assert_eq!(p.store().value(&key), Some(CacheValue::from("v")));

    grid.network.unblock(b.id());
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prepare_then_rollback_on_single_owner() {
    let grid = TestGrid::start(2, GridConfig::for_testing().with_backups(0));
    let (p, n) = (grid.node(0), grid.node(1));
    let key = key_with_owners(n, &[p.id()]);

    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "rolled-back").unwrap();

    bounded(n.transactions().prepare(&tx).wait()).await.unwrap();
    assert!(!tx.one_phase_commit());
    assert_eq!(p.store().value(&key), None);
    assert_eq!(p.participant().locks().holder(&key), Some(tx.version()));

    let outcome = bounded(n.transactions().rollback(&tx)).await.unwrap();
    assert!(!outcome.committed);
    assert_eq!(outcome.nodes, vec![p.id()]);
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(p.store().value(&key), None);
    assert!(p.participant().locks().is_empty());

    // Commit through the full path still takes the single-owner shortcut
    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "committed").unwrap();
    let outcome = bounded(n.transactions().commit(&tx)).await.unwrap();
    assert!(outcome.committed);
    assert!(tx.one_phase_commit());
    assert_eq!(p.store().value(&key), Some(CacheValue::from("committed")));

    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_commit_cannot_overwrite_prepared_lock() {
    let grid = TestGrid::start(2, GridConfig::for_testing().with_backups(0));
    let (p, n) = (grid.node(0), grid.node(1));
    let key = key_with_owners(n, &[p.id()]);

    let holder = n.transactions().begin(TxOptions::pessimistic());
    holder.put(key.clone(), "holder").unwrap();
    bounded(n.transactions().prepare(&holder).wait()).await.unwrap();

    for attempt in 0..16 {
        let tx = n
            .transactions()
            .begin(TxOptions::pessimistic().with_sync_commit(false));
        tx.put(key.clone(), format!("intruder-{attempt}")).unwrap();

        // Not waiting for the owner; the conflict usually surfaces at finish
        let prepared = bounded(n.transactions().prepare(&tx).wait()).await;
        assert!(tx.prepare_unconfirmed());

        let finished = bounded(n.transactions().finish(&tx, true).wait()).await;
        assert!(finished.is_err());
        if prepared.is_ok() {
            assert!(matches!(
                finished,
                Err(TxError::Finish {
                    cause: RemoteError::LockConflict { holder: h, .. },
                    ..
                }) if h == holder.version()
            ));
        }
        assert_eq!(p.store().value(&key), None);
        assert_eq!(p.participant().locks().holder(&key), Some(holder.version()));
    }
    assert_eq!(n.transactions().active_count(), 1);

    bounded(n.transactions().finish(&holder, true).wait()).await.unwrap();
    assert_eq!(p.store().value(&key), Some(CacheValue::from("holder")));
    assert!(p.participant().locks().is_empty());

    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_losing_sole_owner_fails_prepare() {
    let grid = TestGrid::start(2, GridConfig::for_testing().with_backups(0));
    let (p, n) = (grid.node(0), grid.node(1));
    let key = key_with_owners(n, &[p.id()]);

    let tx = n.transactions().begin(TxOptions::pessimistic());
    tx.put(key.clone(), "v").unwrap();

    grid.network.block(p.id());
    let prepare = n.transactions().prepare(&tx);
    grid.cluster.fail(p.id());

    let err = bounded(prepare.wait()).await.unwrap_err();
    assert!(err.is_topology());
    assert_eq!(
        err,
        TxError::Topology {
            node: p.id(),
            keys: vec![key.clone()]
        }
    );

    bounded(n.transactions().rollback(&tx)).await.unwrap();
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(n.transactions().active_count(), 0);

    grid.network.unblock(p.id());
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_serialize_on_locks() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let (p, b, n) = (grid.node(0), grid.node(1), grid.node(2));
    let key = key_with_owners(n, &[p.id(), b.id()]);

    let first = n.transactions().begin(TxOptions::pessimistic());
    first.put(key.clone(), "first").unwrap();
    bounded(n.transactions().prepare(&first).wait()).await.unwrap();

    // A second writer from another node conflicts while the first holds the key
    let second = b.transactions().begin(TxOptions::pessimistic());
    second.put(key.clone(), "second").unwrap();
    let err = bounded(b.transactions().commit(&second)).await.unwrap_err();
    assert!(matches!(err, TxError::Prepare { .. }));
    assert_eq!(second.state(), TxState::RolledBack);

    bounded(n.transactions().finish(&first, true).wait())
        .await
        .unwrap();

    let third = b.transactions().begin(TxOptions::pessimistic());
    third.put(key.clone(), "third").unwrap();
    bounded(b.transactions().commit(&third)).await.unwrap();
    assert_eq!(p.store().value(&key), Some(CacheValue::from("third")));
    assert_eq!(b.store().value(&key), Some(CacheValue::from("third")));
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_read_returns_owned_value() {
    let grid = TestGrid::start(2, GridConfig::for_testing().with_backups(0));
    let (p, n) = (grid.node(0), grid.node(1));
    let key = key_with_owners(n, &[p.id()]);

    bounded(n.atomic().put(key.clone(), "stored")).await.unwrap();
    n.near_store().remove_entry(&n.near_store().entry(&key));

    let tx = n.transactions().begin(TxOptions::optimistic());
    tx.read(key.clone()).unwrap();
    let outcome = bounded(n.transactions().prepare(&tx).wait()).await.unwrap();
    assert_eq!(outcome.owned_values.len(), 1);
    assert_eq!(outcome.owned_values[0].key, key);
    assert_eq!(n.near_store().value(&key), Some(CacheValue::from("stored")));

    bounded(n.transactions().finish(&tx, true).wait())
        .await
        .unwrap();
    grid.stop().await;
}

/// Store whose writes fail once armed
#[derive(Default)]
struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl EntryStore for FailingStore {
    fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.inner.peek(key)
    }

    fn entry(&self, key: &CacheKey) -> Arc<CacheEntry> {
        self.inner.entry(key)
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        self.inner.remove_entry(entry)
    }

    fn remove_versioned(&self, key: &CacheKey, version: TxVersion) -> bool {
        self.inner.remove_versioned(key, version)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn write(
        &self,
        key: &CacheKey,
        value: Option<CacheValue>,
        version: TxVersion,
        ttl: Option<Duration>,
    ) -> Result<UpdateOutcome, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk on fire".into()));
        }
        self.inner.write(key, value, version, ttl)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heuristic_failure_invalidates_near_copy() {
    common::init_tracing();
    let cluster = gridcore::common::Cluster::new();
    let network = LocalNetwork::new();
    let config = GridConfig::for_testing();

    let failing = Arc::new(FailingStore::default());
    let p = GridNode::start_with_store(&cluster, &network, config.clone(), failing.clone()).unwrap();
    let b = GridNode::start(&cluster, &network, config.clone()).unwrap();
    let n = GridNode::start(&cluster, &network, config).unwrap();
    let key = key_with_owners(&n, &[p.id(), b.id()]);

    bounded(n.atomic().put(key.clone(), "before")).await.unwrap();
    assert_eq!(n.near_store().value(&key), Some(CacheValue::from("before")));

    failing.failing.store(true, Ordering::SeqCst);
    let tx = n.transactions().begin(TxOptions::pessimistic().implicit());
    tx.put(key.clone(), "after").unwrap();
    bounded(n.transactions().prepare(&tx).wait()).await.unwrap();
    assert!(!tx.one_phase_commit());

    let err = bounded(n.transactions().finish(&tx, true).wait())
        .await
        .unwrap_err();
    assert!(err.is_heuristic());
    assert!(matches!(err, TxError::Heuristic { node, .. } if node == p.id()));
    assert_eq!(tx.state(), TxState::Unknown);
    assert!(tx.commit_error().is_some_and(|e| e.is_heuristic()));
    assert!(tx.is_closed());

    // The outcome on P is unknown, so the near copy must not be served
    assert_eq!(n.near_store().value(&key), None);
    assert_eq!(b.store().value(&key), Some(CacheValue::from("after")));
    assert_eq!(n.transactions().active_count(), 0);

    for node in [&p, &b, &n] {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_lock_blocks_other_nodes() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let (p, b, n) = (grid.node(0), grid.node(1), grid.node(2));
    let key = key_with_owners(n, &[p.id(), b.id()]);

    let holder = n.transactions().begin(TxOptions::pessimistic());
    bounded(n.transactions().lock(&holder, vec![key.clone()]).wait())
        .await
        .unwrap();
    assert_eq!(p.participant().locks().holder(&key), Some(holder.version()));

    let other = b.transactions().begin(TxOptions::pessimistic());
    let err = bounded(b.transactions().lock(&other, vec![key.clone()]).wait())
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::Lock { node, .. } if node == p.id()));
    bounded(b.transactions().rollback(&other)).await.unwrap();

    holder.put(key.clone(), "locked-write").unwrap();
    bounded(n.transactions().commit(&holder)).await.unwrap();
    assert_eq!(p.store().value(&key), Some(CacheValue::from("locked-write")));
    assert!(p.participant().locks().is_empty());
    assert!(b.participant().locks().is_empty());
    grid.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_transactions_in_parallel() {
    let grid = TestGrid::start(3, GridConfig::for_testing());
    let n = grid.node(2);

    let commits = (0..16).map(|i| {
        let tx = n.transactions().begin(TxOptions::optimistic());
        tx.put(format!("parallel-{i}"), format!("{i}")).unwrap();
        async move { n.transactions().commit(&tx).await }
    });
    let results = bounded(futures::future::join_all(commits)).await;
    assert!(results.iter().all(|r| r.is_ok()));

    for i in 0..16 {
        let key = CacheKey::from(format!("parallel-{i}"));
        for owner in n.affinity().current_nodes(&key) {
            let node = grid.nodes.iter().find(|g| g.id() == owner).unwrap();
            assert_eq!(node.store().value(&key), Some(CacheValue::from(format!("{i}"))));
        }
    }
    assert_eq!(n.transactions().active_count(), 0);
    grid.stop().await;
}
