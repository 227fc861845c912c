//! The messaging substrate.
//!
//! Inbound envelopes are buffered per sender until [`Messaging::start`],
//! then dispatched to the worker pool of their I/O policy. Ordered envelopes
//! go through a [`MessageSet`] per (topic, sender) which releases them in
//! sequence order; unordered ones are handed to the topic's listeners
//! directly on the worker.

use crate::busy::{BusyLock, WorkerGuard, wait_for_zero};
use crate::closed::ClosedTopics;
use crate::config::MessagingConfig;
use crate::listener::{Listener, ListenerChain, ListenerRegistry};
use crate::message_set::MessageSet;
use crate::pool::{Pools, Rejected, Task};
use crate::transport::{InboundHandler, Transport};
use crate::{MessagingError, Result};
use dashmap::DashMap;
use gridcore_common::{NodeEvent, NodeId, Subscription, TopologyProvider};
use gridcore_protocol::{Envelope, IoPolicy, Message, OrderInfo, Topic};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;

/// Handle to a node's messaging substrate; cheap to clone.
#[derive(Clone)]
pub struct Messaging {
    inner: Arc<Inner>,
}

struct Inner {
    local: NodeId,
    config: MessagingConfig,
    topology: Arc<dyn TopologyProvider>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    pools: Pools,
    listeners: ListenerRegistry,
    /// Reassembly buffers by topic, then sender
    message_sets: DashMap<Topic, HashMap<NodeId, Arc<MessageSet>>>,
    /// Outgoing ordered sequence counters by (topic, destination)
    message_ids: DashMap<(Topic, NodeId), AtomicU64>,
    /// Flipped once by `start`; readers decide whether to buffer
    started: RwLock<bool>,
    started_fast: AtomicBool,
    /// Inbound envelopes received before start, by sender
    waiting: Mutex<HashMap<NodeId, Vec<Envelope>>>,
    busy: BusyLock,
    /// Dispatched tasks not yet finished
    workers: Arc<AtomicUsize>,
    closed: ClosedTopics,
    skipped: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl Messaging {
    /// Create a substrate; must be called from within a tokio runtime.
    pub fn new(
        config: MessagingConfig,
        topology: Arc<dyn TopologyProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| MessagingError::NoRuntime)?;
        let pools = Pools::start(&config, &runtime);

        Ok(Self {
            inner: Arc::new(Inner {
                local: topology.local_node_id(),
                closed: ClosedTopics::new(config.max_closed_topics),
                config,
                topology,
                transport,
                runtime,
                pools,
                listeners: ListenerRegistry::default(),
                message_sets: DashMap::new(),
                message_ids: DashMap::new(),
                started: RwLock::new(false),
                started_fast: AtomicBool::new(false),
                waiting: Mutex::new(HashMap::new()),
                busy: BusyLock::default(),
                workers: Arc::new(AtomicUsize::new(0)),
                skipped: AtomicU64::new(0),
                subscription: Mutex::new(None),
            }),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.local
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// Leave the buffering state and flush envelopes from known senders.
    pub fn start(&self) {
        self.inner.start();
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Stop accepting work and wait (bounded) for in-flight work to drain.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Unordered send to one node.
    pub fn send(
        &self,
        node: NodeId,
        topic: Topic,
        message: Message,
        policy: IoPolicy,
    ) -> Result<()> {
        self.inner
            .send_envelope(node, Envelope::new(policy, topic, message))
    }

    /// Unordered send to several nodes; every node is attempted and the
    /// first failure is returned.
    pub fn send_to_many(
        &self,
        nodes: &[NodeId],
        topic: Topic,
        message: Message,
        policy: IoPolicy,
    ) -> Result<()> {
        let envelope = Envelope::new(policy, topic, message);
        self.inner.fan_out(nodes, envelope, |_, envelope| envelope)
    }

    /// Ordered send; `sequence` comes from [`Messaging::next_message_id`].
    pub fn send_ordered(
        &self,
        node: NodeId,
        topic: Topic,
        message: Message,
        policy: IoPolicy,
        sequence: u64,
        timeout: Duration,
        skip_on_timeout: bool,
    ) -> Result<()> {
        let envelope = Envelope::ordered(policy, topic, message, sequence, timeout, skip_on_timeout);
        self.inner.send_envelope(node, envelope)
    }

    /// Ordered send to several nodes, each with its own next sequence number.
    pub fn send_ordered_to_many(
        &self,
        nodes: &[NodeId],
        topic: Topic,
        message: Message,
        policy: IoPolicy,
        timeout: Duration,
        skip_on_timeout: bool,
    ) -> Result<()> {
        let envelope = Envelope::ordered(policy, topic, message, 0, timeout, skip_on_timeout);
        let inner = self.inner.clone();
        self.inner.fan_out(nodes, envelope, move |node, mut envelope| {
            if let Some(order) = envelope.order.as_mut() {
                order.sequence = inner.next_message_id(&envelope.topic, node);
            }
            envelope
        })
    }

    /// Next ordered sequence number for (topic, destination), starting at 1.
    pub fn next_message_id(&self, topic: &Topic, node: NodeId) -> u64 {
        self.inner.next_message_id(topic, node)
    }

    /// Forget outgoing sequence counters of a topic
    pub fn remove_message_id(&self, topic: &Topic) {
        self.inner.message_ids.retain(|(t, _), _| t != topic);
    }

    /// Register a listener and drain any messages already buffered for the topic.
    pub fn add_listener(&self, topic: Topic, listener: Listener) {
        self.inner.add_listener(topic, listener);
    }

    /// Remove one listener, or all of them with `None`. Returns whether a
    /// listener was removed.
    pub fn remove_listener(&self, topic: &Topic, listener: Option<&Listener>) -> bool {
        self.inner.remove_listener(topic, listener)
    }

    /// Next expected sequence and buffered count of a (topic, sender) set
    pub fn buffered(&self, topic: &Topic, sender: NodeId) -> Option<(u64, usize)> {
        self.inner
            .message_sets
            .get(topic)
            .and_then(|sets| sets.get(&sender).cloned())
            .map(|set| (set.next_expected(), set.pending_len()))
    }

    /// Ordered sequence numbers given up on after a skip-on-timeout
    pub fn skipped_count(&self) -> u64 {
        self.inner.skipped.load(Ordering::SeqCst)
    }

    /// Whether `stop` has begun
    pub fn is_stopping(&self) -> bool {
        self.inner.busy.is_blocked()
    }

    /// Dispatched tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }
}

impl InboundHandler for Messaging {
    fn on_envelope(&self, sender: NodeId, envelope: Envelope) {
        self.inner.on_envelope(sender, envelope);
    }
}

impl Inner {
    fn is_started(&self) -> bool {
        self.started_fast.load(Ordering::SeqCst) || *self.started.read()
    }

    fn start(self: &Arc<Self>) {
        if self.is_started() {
            return;
        }

        // Subscribe before the flip so no join in between is missed
        let weak = Arc::downgrade(self);
        let subscription = self.topology.subscribe(Arc::new(move |event: &NodeEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_node_event(event);
            }
        }));
        *self.subscription.lock() = Some(subscription);

        let flushed: Vec<(NodeId, Vec<Envelope>)> = {
            let mut started = self.started.write();
            if *started {
                return;
            }
            *started = true;
            self.started_fast.store(true, Ordering::SeqCst);

            let mut waiting = self.waiting.lock();
            let ready: Vec<NodeId> = waiting
                .keys()
                .filter(|id| self.topology.node(**id).is_some())
                .copied()
                .collect();
            ready
                .into_iter()
                .filter_map(|id| waiting.remove(&id).map(|envelopes| (id, envelopes)))
                .collect()
        };

        for (sender, envelopes) in flushed {
            tracing::debug!(sender = %sender, count = envelopes.len(), "flushing messages received before start");
            for envelope in envelopes {
                self.dispatch(sender, envelope);
            }
        }

        tracing::info!(node = %self.local, "messaging started");
    }

    async fn stop(&self) {
        let timeout = self.config.shutdown_timeout();

        if !self.busy.block(timeout).await {
            tracing::warn!(node = %self.local, "timed out waiting for in-flight sends to finish");
        }

        self.subscription.lock().take();

        if tokio::time::timeout(timeout, self.pools.shutdown())
            .await
            .is_err()
        {
            tracing::warn!(node = %self.local, "timed out waiting for worker pools to drain");
        }

        if !wait_for_zero(&self.workers, timeout).await {
            tracing::warn!(
                node = %self.local,
                in_flight = self.workers.load(Ordering::SeqCst),
                "timed out waiting for dispatched work to finish"
            );
        }

        for entry in self.message_sets.iter() {
            for set in entry.value().values() {
                set.mark_removed();
            }
        }
        self.message_sets.clear();
        self.waiting.lock().clear();

        tracing::info!(node = %self.local, "messaging stopped");
    }

    fn send_envelope(self: &Arc<Self>, node: NodeId, envelope: Envelope) -> Result<()> {
        let Some(_busy) = self.busy.enter() else {
            return Err(MessagingError::Stopping);
        };

        if node == self.local {
            if !self.is_started() {
                return Err(MessagingError::NotStarted);
            }
            self.dispatch(self.local, envelope);
            return Ok(());
        }

        let target = self
            .topology
            .node(node)
            .ok_or(MessagingError::NodeNotFound(node))?;

        let topic = envelope.topic.clone();
        let policy = envelope.policy;
        self.transport
            .send_message(&target, envelope)
            .map_err(|source| MessagingError::Communication {
                node,
                topic,
                policy,
                source,
            })
    }

    fn fan_out(
        self: &Arc<Self>,
        nodes: &[NodeId],
        envelope: Envelope,
        prepare: impl Fn(NodeId, Envelope) -> Envelope,
    ) -> Result<()> {
        let mut first_error = None;
        let mut envelope = Some(envelope);
        let last = nodes.len().saturating_sub(1);

        for (idx, &node) in nodes.iter().enumerate() {
            // The last destination takes the envelope itself, the others a copy
            let next = if idx == last {
                envelope.take()
            } else {
                envelope.as_ref().map(Envelope::copy_for_fan_out)
            };
            let Some(next) = next else {
                break;
            };

            if let Err(e) = self.send_envelope(node, prepare(node, next)) {
                tracing::debug!(node = %node, "multi-node send failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn next_message_id(&self, topic: &Topic, node: NodeId) -> u64 {
        self.message_ids
            .entry((topic.clone(), node))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    fn on_envelope(self: &Arc<Self>, sender: NodeId, envelope: Envelope) {
        let Some(_busy) = self.busy.enter() else {
            tracing::debug!(sender = %sender, "received message while stopping (will ignore)");
            return;
        };

        if !self.started_fast.load(Ordering::SeqCst) {
            let started = self.started.read();
            if !*started {
                tracing::trace!(sender = %sender, topic = %envelope.topic, "buffering message until start");
                self.waiting.lock().entry(sender).or_default().push(envelope);
                return;
            }
        }

        if self.topology.node(sender).is_none() {
            tracing::debug!(
                sender = %sender,
                topic = %envelope.topic,
                "ignoring message from node that is not in topology"
            );
            return;
        }

        self.dispatch(sender, envelope);
    }

    fn dispatch(self: &Arc<Self>, sender: NodeId, envelope: Envelope) {
        let policy = envelope.policy;
        let inner = self.clone();

        match envelope.order {
            Some(order) => self.execute(
                policy,
                Box::new(move || inner.process_ordered(sender, order, envelope)),
            ),
            None => self.execute(
                policy,
                Box::new(move || inner.process_regular(sender, envelope)),
            ),
        }
    }

    /// Run a task on the policy's pool, inline when the pool is saturated.
    /// Tasks reaching a shut down pool are dropped.
    fn execute(&self, policy: IoPolicy, task: Task) {
        let guard = WorkerGuard::new(&self.workers);
        let task: Task = Box::new(move || {
            let _guard = guard;
            task();
        });

        let pool = self.pools.get(policy);
        match pool.execute(task) {
            Ok(()) => {}
            Err(Rejected::Saturated(task)) => {
                tracing::warn!(
                    policy = pool.policy().as_str(),
                    "failed to queue message for processing, running it in the calling thread \
                     (increase the pool size for this policy)"
                );
                task();
            }
            Err(Rejected::Closed(_)) => {
                tracing::debug!(
                    policy = pool.policy().as_str(),
                    "worker pool is shut down, dropping message processing task"
                );
            }
        }
    }

    fn process_regular(&self, sender: NodeId, envelope: Envelope) {
        match self.listeners.get(&envelope.topic) {
            Some(chain) => chain.notify(sender, &envelope.message),
            None => tracing::debug!(
                sender = %sender,
                topic = %envelope.topic,
                "no listeners for received message (will ignore)"
            ),
        }
    }

    fn process_ordered(self: &Arc<Self>, sender: NodeId, order: OrderInfo, envelope: Envelope) {
        let Envelope {
            policy,
            topic,
            message,
            ..
        } = envelope;

        let timeout = if order.timeout.is_zero() {
            self.config.network_timeout()
        } else {
            order.timeout
        };

        let (set, created) = {
            let mut sets = self.message_sets.entry(topic.clone()).or_default();
            match sets.get(&sender) {
                Some(set) => (set.clone(), false),
                None => {
                    let set = Arc::new(MessageSet::new(
                        topic.clone(),
                        sender,
                        policy,
                        timeout,
                        order.skip_on_timeout,
                    ));
                    sets.insert(sender, set.clone());
                    (set, true)
                }
            }
        };

        set.add(order.sequence, message);

        if self.topology.node(sender).is_none() {
            tracing::debug!(sender = %sender, topic = %topic, "sender left topology, discarding ordered messages");
            self.remove_message_set(&set);
            return;
        }

        if created {
            self.schedule_timeout(&set, timeout);
        }

        match self.listeners.get(&topic) {
            Some(chain) => {
                self.unwind(&set, &chain, false);
            }
            None if self.closed.is_closed(&topic, sender) => {
                tracing::debug!(sender = %sender, topic = %topic, "message for closed topic (will ignore)");
                self.remove_message_set(&set);
            }
            None => {
                tracing::debug!(
                    sender = %sender,
                    topic = %topic,
                    seq = order.sequence,
                    "no listener for ordered message, keeping it until one is registered"
                );
            }
        }
    }

    /// Drain a set while new messages keep arriving. Returns whether the
    /// reservation was obtained at least once.
    fn unwind(&self, set: &MessageSet, chain: &ListenerChain, force: bool) -> bool {
        let mut force = force;
        let mut progressed = false;

        loop {
            let Some(reservation) = set.try_reserve() else {
                // The holder re-checks `changed` after releasing
                return progressed;
            };

            let unwound = set.unwind(&reservation, force);
            force = false;
            progressed = true;

            if let Some(range) = unwound.skipped {
                self.skipped.fetch_add(range.len(), Ordering::SeqCst);
            }

            for message in &unwound.messages {
                chain.notify(set.sender(), message);
            }

            drop(reservation);

            if !set.changed() {
                return progressed;
            }
        }
    }

    fn schedule_timeout(self: &Arc<Self>, set: &Arc<MessageSet>, after: Duration) {
        let weak_inner = Arc::downgrade(self);
        let weak_set = Arc::downgrade(set);

        self.runtime.spawn(async move {
            tokio::time::sleep(after).await;

            let (Some(inner), Some(set)) = (weak_inner.upgrade(), weak_set.upgrade()) else {
                return;
            };
            if set.is_removed() {
                return;
            }

            let policy = set.policy();
            let task_inner = inner.clone();
            inner.execute(policy, Box::new(move || task_inner.on_timeout(&set)));
        });
    }

    fn on_timeout(self: &Arc<Self>, set: &Arc<MessageSet>) {
        let Some(_busy) = self.busy.enter() else {
            return;
        };
        if set.is_removed() {
            return;
        }

        let Some(chain) = self.listeners.get(set.topic()) else {
            tracing::debug!(
                sender = %set.sender(),
                topic = %set.topic(),
                "removing message set due to timeout (no listener)"
            );
            self.remove_message_set(set);
            return;
        };

        let mut rearm = set.timeout();
        if set.skip_on_timeout() {
            while let Some(idle) = set.idle_time() {
                if idle < set.timeout() {
                    rearm = set.timeout() - idle;
                    break;
                }
                if !self.unwind(set, &chain, true) {
                    break;
                }
            }
        }

        // Someone is still listening
        self.schedule_timeout(set, rearm.max(Duration::from_millis(1)));
    }

    fn remove_message_set(&self, set: &Arc<MessageSet>) {
        let topic = set.topic();
        let mut emptied = false;

        if let Some(mut sets) = self.message_sets.get_mut(topic) {
            if sets
                .get(&set.sender())
                .is_some_and(|current| Arc::ptr_eq(current, set))
            {
                sets.remove(&set.sender());
            }
            emptied = sets.is_empty();
        }

        if emptied {
            self.message_sets.remove_if(topic, |_, sets| sets.is_empty());
        }

        set.mark_removed();
    }

    fn add_listener(self: &Arc<Self>, topic: Topic, listener: Listener) {
        self.closed.reopen(&topic);
        self.listeners.add(topic.clone(), listener);

        let sets: Vec<Arc<MessageSet>> = self
            .message_sets
            .get(&topic)
            .map(|sets| sets.values().cloned().collect())
            .unwrap_or_default();

        for set in sets {
            let inner = self.clone();
            self.execute(
                set.policy(),
                Box::new(move || {
                    if let Some(chain) = inner.listeners.get(set.topic()) {
                        inner.unwind(&set, &chain, false);
                    }
                }),
            );
        }
    }

    fn remove_listener(&self, topic: &Topic, listener: Option<&Listener>) -> bool {
        let removal = self.listeners.remove(topic, listener);

        if removal.emptied {
            self.closed.close(topic.clone(), None);
            if let Some((_, sets)) = self.message_sets.remove(topic) {
                for set in sets.values() {
                    set.mark_removed();
                }
            }
        }

        removal.removed
    }

    fn on_node_event(self: &Arc<Self>, event: &NodeEvent) {
        let id = event.node().id;

        match event {
            NodeEvent::Joined(_) => {
                let delayed = {
                    let started = self.started.read();
                    if !*started {
                        // Start flushes everything from known nodes
                        return;
                    }
                    self.waiting.lock().remove(&id)
                };

                if let Some(envelopes) = delayed {
                    tracing::debug!(sender = %id, count = envelopes.len(), "flushing messages delayed until node joined");
                    for envelope in envelopes {
                        self.dispatch(id, envelope);
                    }
                }
            }
            NodeEvent::Left(_) | NodeEvent::Failed(_) => {
                let mut removed = Vec::new();
                self.message_sets.retain(|_, sets| {
                    if let Some(set) = sets.remove(&id) {
                        removed.push(set);
                    }
                    !sets.is_empty()
                });

                for set in removed {
                    set.mark_removed();
                    self.closed.close(set.topic().clone(), Some(id));
                    tracing::debug!(sender = %id, topic = %set.topic(), "removed message set of departed node");
                }

                self.message_ids.retain(|(_, node), _| *node != id);

                let _started = self.started.write();
                self.waiting.lock().remove(&id);
            }
        }
    }
}
