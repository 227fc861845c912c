//! One grid member assembled from its parts.

use crate::config::GridConfig;
use crate::error::Result;
use gridcore_common::{
    Affinity, Cluster, EntryStore, LocalTopology, MemoryStore, NodeId, RendezvousAffinity,
    VersionClock,
};
use gridcore_messaging::{LocalNetwork, Messaging};
use gridcore_near::NearAtomicCache;
use gridcore_protocol::Topic;
use gridcore_tx::{TxCoordinator, TxParticipant};
use std::sync::Arc;

/// A started grid node.
pub struct GridNode {
    id: NodeId,
    cluster: Arc<Cluster>,
    network: Arc<LocalNetwork>,
    topology: Arc<LocalTopology>,
    affinity: Arc<dyn Affinity>,
    messaging: Messaging,
    store: Arc<dyn EntryStore>,
    near_store: Arc<dyn EntryStore>,
    coordinator: TxCoordinator,
    atomic: NearAtomicCache,
}

impl GridNode {
    /// Join `cluster` with an in-memory data store and start serving.
    pub fn start(cluster: &Arc<Cluster>, network: &Arc<LocalNetwork>, config: GridConfig) -> Result<Self> {
        Self::start_with_store(cluster, network, config, Arc::new(MemoryStore::new()))
    }

    /// Like [`GridNode::start`] with a caller supplied data store.
    pub fn start_with_store(
        cluster: &Arc<Cluster>,
        network: &Arc<LocalNetwork>,
        config: GridConfig,
        store: Arc<dyn EntryStore>,
    ) -> Result<Self> {
        let id = NodeId::random();
        let topology = cluster.join(id);

        let messaging = match Messaging::new(config.messaging.clone(), topology.clone(), network.transport(id)) {
            Ok(messaging) => messaging,
            Err(e) => {
                cluster.leave(id);
                return Err(e.into());
            }
        };
        network.register(id, Arc::new(messaging.clone()));

        let affinity: Arc<dyn Affinity> = Arc::new(RendezvousAffinity::new(
            topology.clone(),
            config.partitions,
            config.backups,
        ));
        let near_store: Arc<dyn EntryStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(VersionClock::new(id));

        let participant = Arc::new(TxParticipant::new(
            messaging.clone(),
            affinity.clone(),
            store.clone(),
            clock.clone(),
            config.tx.finished_history,
        ));
        messaging.add_listener(Topic::Cache, participant.listener());

        let coordinator = TxCoordinator::new(
            config.tx.clone(),
            messaging.clone(),
            affinity.clone(),
            participant,
            near_store.clone(),
            clock.clone(),
        );
        coordinator.start(topology.as_ref());

        let atomic = NearAtomicCache::new(
            messaging.clone(),
            affinity.clone(),
            store.clone(),
            near_store.clone(),
            clock,
            &config.near,
        );
        atomic.start(topology.as_ref());

        messaging.start();
        tracing::info!(node = %id, topology_version = affinity.topology_version(), "grid node started");

        Ok(Self {
            id,
            cluster: cluster.clone(),
            network: network.clone(),
            topology,
            affinity,
            messaging,
            store,
            near_store,
            coordinator,
            atomic,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn topology(&self) -> &Arc<LocalTopology> {
        &self.topology
    }

    pub fn affinity(&self) -> &Arc<dyn Affinity> {
        &self.affinity
    }

    pub fn messaging(&self) -> &Messaging {
        &self.messaging
    }

    /// Partitions this node owns as primary or backup
    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Near copies of remote owned entries
    pub fn near_store(&self) -> &Arc<dyn EntryStore> {
        &self.near_store
    }

    pub fn transactions(&self) -> &TxCoordinator {
        &self.coordinator
    }

    pub fn participant(&self) -> &Arc<TxParticipant> {
        self.coordinator.participant()
    }

    pub fn atomic(&self) -> &NearAtomicCache {
        &self.atomic
    }

    /// Leave the cluster, drain the substrate and disconnect.
    pub async fn stop(&self) {
        self.coordinator.stop();
        self.atomic.stop();
        self.cluster.leave(self.id);
        self.messaging.stop().await;
        self.network.unregister(self.id);
        tracing::info!(node = %self.id, "grid node stopped");
    }
}
