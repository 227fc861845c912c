//! Per-topic listener registry.
//!
//! Each topic maps to an immutable chain of listeners. Adding or removing a
//! listener builds a new chain and swaps it in, so dispatch only clones an
//! `Arc` and never holds a map lock while callbacks run.

use dashmap::DashMap;
use gridcore_common::NodeId;
use gridcore_protocol::{Message, Topic};
use std::sync::Arc;

/// Receives messages delivered on a topic.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, sender: NodeId, message: &Message);
}

impl<F> MessageListener for F
where
    F: Fn(NodeId, &Message) + Send + Sync,
{
    fn on_message(&self, sender: NodeId, message: &Message) {
        self(sender, message)
    }
}

pub type Listener = Arc<dyn MessageListener>;

/// Immutable snapshot of a topic's listeners.
#[derive(Clone)]
pub(crate) struct ListenerChain {
    listeners: Arc<[Listener]>,
}

impl ListenerChain {
    fn with(&self, listener: Listener) -> Self {
        let mut listeners: Vec<Listener> = self.listeners.iter().cloned().collect();
        listeners.push(listener);
        Self {
            listeners: listeners.into(),
        }
    }

    fn without(&self, listener: &Listener) -> Option<Self> {
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        (listeners.len() != self.listeners.len()).then(|| Self {
            listeners: listeners.into(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn notify(&self, sender: NodeId, message: &Message) {
        for listener in self.listeners.iter() {
            listener.on_message(sender, message);
        }
    }
}

/// Outcome of removing listeners from a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Removal {
    pub(crate) removed: bool,
    /// No listener remains for the topic
    pub(crate) emptied: bool,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    chains: DashMap<Topic, ListenerChain>,
}

impl ListenerRegistry {
    pub(crate) fn get(&self, topic: &Topic) -> Option<ListenerChain> {
        self.chains.get(topic).map(|c| c.value().clone())
    }

    pub(crate) fn add(&self, topic: Topic, listener: Listener) {
        self.chains
            .entry(topic)
            .and_modify(|chain| *chain = chain.with(listener.clone()))
            .or_insert_with(|| ListenerChain {
                listeners: vec![listener.clone()].into(),
            });
    }

    /// Remove one listener, or every listener when `listener` is `None`.
    pub(crate) fn remove(&self, topic: &Topic, listener: Option<&Listener>) -> Removal {
        let Some(listener) = listener else {
            let removed = self.chains.remove(topic).is_some();
            return Removal {
                removed,
                emptied: true,
            };
        };

        let mut removed = false;
        if let Some(mut chain) = self.chains.get_mut(topic)
            && let Some(next) = chain.without(listener)
        {
            *chain = next;
            removed = true;
        }

        let emptied = self
            .chains
            .remove_if(topic, |_, chain| chain.len() == 0)
            .is_some()
            || !self.chains.contains_key(topic);

        Removal { removed, emptied }
    }
}
