//! Cluster topology: membership, snapshots and node events.
//!
//! The grid core only consumes [`TopologyProvider`]. [`Cluster`] is an
//! in-process membership service shared by every node of a test or embedded
//! deployment; each node sees it through a [`LocalTopology`] view.

use crate::ids::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of historical topology snapshots kept by [`Cluster`]
const SNAPSHOT_HISTORY: usize = 64;

/// A live cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Join order, increasing across the cluster's lifetime
    pub order: u64,
}

/// Membership change notification.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Joined(ClusterNode),
    Left(ClusterNode),
    Failed(ClusterNode),
}

impl NodeEvent {
    pub fn node(&self) -> &ClusterNode {
        match self {
            NodeEvent::Joined(node) | NodeEvent::Left(node) | NodeEvent::Failed(node) => node,
        }
    }

    /// Whether the event removes the node from the topology
    pub fn is_departure(&self) -> bool {
        matches!(self, NodeEvent::Left(_) | NodeEvent::Failed(_))
    }
}

pub type NodeEventListener = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

/// Handle returned by [`TopologyProvider::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that owns nothing
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Membership as seen from one node.
pub trait TopologyProvider: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    /// Resolve a live node; `None` once it left or failed
    fn node(&self, id: NodeId) -> Option<ClusterNode>;

    /// All live nodes ordered by join order
    fn nodes(&self) -> Vec<ClusterNode>;

    /// Current topology version, bumped on every membership change
    fn topology_version(&self) -> u64;

    /// Members at a past topology version, if still remembered
    fn snapshot(&self, version: u64) -> Option<Vec<ClusterNode>>;

    /// Register for membership events
    fn subscribe(&self, listener: NodeEventListener) -> Subscription;
}

struct Subscriber {
    id: u64,
    owner: NodeId,
    listener: NodeEventListener,
}

struct Membership {
    nodes: BTreeMap<NodeId, ClusterNode>,
    version: u64,
    history: VecDeque<(u64, Vec<ClusterNode>)>,
}

impl Membership {
    fn sorted_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.order);
        nodes
    }

    fn record(&mut self) {
        self.version += 1;
        let snapshot = self.sorted_nodes();
        self.history.push_back((self.version, snapshot));
        while self.history.len() > SNAPSHOT_HISTORY {
            self.history.pop_front();
        }
    }
}

/// In-process membership service shared by all nodes of a deployment.
pub struct Cluster {
    membership: RwLock<Membership>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_order: AtomicU64,
    next_subscriber: AtomicU64,
}

impl Cluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            membership: RwLock::new(Membership {
                nodes: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_order: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
        })
    }

    /// Add a node and return its view of the topology.
    pub fn join(self: &Arc<Self>, id: NodeId) -> Arc<LocalTopology> {
        let node = ClusterNode {
            id,
            order: self.next_order.fetch_add(1, Ordering::SeqCst),
        };

        {
            let mut membership = self.membership.write();
            membership.nodes.insert(id, node.clone());
            membership.record();
        }

        tracing::debug!(node = %id, "node joined");
        self.notify(&NodeEvent::Joined(node));

        Arc::new(LocalTopology {
            local: id,
            cluster: self.clone(),
        })
    }

    /// Graceful departure
    pub fn leave(&self, id: NodeId) -> bool {
        self.depart(id, NodeEvent::Left)
    }

    /// Abrupt departure detected by failure detection
    pub fn fail(&self, id: NodeId) -> bool {
        self.depart(id, NodeEvent::Failed)
    }

    fn depart(&self, id: NodeId, event: fn(ClusterNode) -> NodeEvent) -> bool {
        let node = {
            let mut membership = self.membership.write();
            let Some(node) = membership.nodes.remove(&id) else {
                return false;
            };
            membership.record();
            node
        };

        tracing::debug!(node = %id, "node departed");
        self.notify(&event(node));
        true
    }

    pub fn version(&self) -> u64 {
        self.membership.read().version
    }

    fn notify(&self, event: &NodeEvent) {
        let departed = event.is_departure().then(|| event.node().id);

        // Snapshot listeners so callbacks run without the registry lock
        let listeners: Vec<NodeEventListener> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| Some(s.owner) != departed)
            .map(|s| s.listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    fn subscribe(self: &Arc<Self>, owner: NodeId, listener: NodeEventListener) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push(Subscriber {
            id,
            owner,
            listener,
        });

        let cluster = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(cluster) = cluster.upgrade() {
                cluster.subscribers.lock().retain(|s| s.id != id);
            }
        })
    }
}

/// One node's view of a [`Cluster`].
pub struct LocalTopology {
    local: NodeId,
    cluster: Arc<Cluster>,
}

impl LocalTopology {
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

impl TopologyProvider for LocalTopology {
    fn local_node_id(&self) -> NodeId {
        self.local
    }

    fn node(&self, id: NodeId) -> Option<ClusterNode> {
        self.cluster.membership.read().nodes.get(&id).cloned()
    }

    fn nodes(&self) -> Vec<ClusterNode> {
        self.cluster.membership.read().sorted_nodes()
    }

    fn topology_version(&self) -> u64 {
        self.cluster.version()
    }

    fn snapshot(&self, version: u64) -> Option<Vec<ClusterNode>> {
        let membership = self.cluster.membership.read();
        if version == membership.version {
            return Some(membership.sorted_nodes());
        }
        membership
            .history
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, nodes)| nodes.clone())
    }

    fn subscribe(&self, listener: NodeEventListener) -> Subscription {
        self.cluster.subscribe(self.local, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave() {
        let cluster = Cluster::new();
        let a = NodeId::random();
        let b = NodeId::random();

        let view_a = cluster.join(a);
        let _view_b = cluster.join(b);

        assert_eq!(view_a.local_node_id(), a);
        assert_eq!(view_a.nodes().len(), 2);
        assert!(view_a.node(b).is_some());
        assert_eq!(view_a.topology_version(), 2);

        assert!(cluster.leave(b));
        assert!(!cluster.leave(b));
        assert!(view_a.node(b).is_none());
        assert_eq!(view_a.topology_version(), 3);
    }

    #[test]
    fn test_snapshots_remember_past_membership() {
        let cluster = Cluster::new();
        let a = NodeId::random();
        let b = NodeId::random();

        let view = cluster.join(a);
        cluster.join(b);
        let v2 = view.topology_version();
        cluster.fail(b);

        assert_eq!(view.snapshot(v2).unwrap().len(), 2);
        assert_eq!(view.snapshot(view.topology_version()).unwrap().len(), 1);
        assert!(view.snapshot(999).is_none());
    }

    #[test]
    fn test_events_delivered_to_other_nodes_only() {
        let cluster = Cluster::new();
        let a = NodeId::random();
        let b = NodeId::random();

        let view_a = cluster.join(a);
        let view_b = cluster.join(b);

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let sink = seen_a.clone();
        let _sub_a = view_a.subscribe(Arc::new(move |e: &NodeEvent| {
            sink.lock().push(e.clone());
        }));
        let sink = seen_b.clone();
        let _sub_b = view_b.subscribe(Arc::new(move |e: &NodeEvent| {
            sink.lock().push(e.clone());
        }));

        cluster.fail(b);

        let seen_a = seen_a.lock();
        assert_eq!(seen_a.len(), 1);
        assert!(matches!(&seen_a[0], NodeEvent::Failed(n) if n.id == b));
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let cluster = Cluster::new();
        let view = cluster.join(NodeId::random());

        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let sub = view.subscribe(Arc::new(move |_: &NodeEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cluster.join(NodeId::random());
        drop(sub);
        cluster.join(NodeId::random());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
