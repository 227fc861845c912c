//! Bounded memory of closed (topic, sender) pairs.
//!
//! Late ordered packets from a node that already left, or for a topic whose
//! last listener was removed, are dropped instead of re-creating a message
//! set that nobody would ever drain. The oldest entries are evicted first.

use gridcore_common::NodeId;
use gridcore_protocol::Topic;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// `None` sender closes the topic for every sender
type ClosedKey = (Topic, Option<NodeId>);

struct Inner {
    /// Live keys and the generation they were inserted at
    live: HashMap<ClosedKey, u64>,
    /// Insertion order; entries whose generation no longer matches are stale
    order: VecDeque<(ClosedKey, u64)>,
    generation: u64,
}

pub(crate) struct ClosedTopics {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ClosedTopics {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                live: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
        }
    }

    pub(crate) fn close(&self, topic: Topic, sender: Option<NodeId>) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let key = (topic, sender);

        inner.live.insert(key.clone(), generation);
        inner.order.push_back((key, generation));

        while inner.live.len() > self.capacity {
            let Some((oldest, generation)) = inner.order.pop_front() else {
                break;
            };
            if inner.live.get(&oldest) == Some(&generation) {
                inner.live.remove(&oldest);
            }
        }

        // Drop stale bookkeeping left behind by reopened keys
        if inner.order.len() > self.capacity * 2 {
            let Inner { live, order, .. } = &mut *inner;
            order.retain(|(key, generation)| live.get(key) == Some(generation));
        }
    }

    pub(crate) fn is_closed(&self, topic: &Topic, sender: NodeId) -> bool {
        let inner = self.inner.lock();
        inner.live.contains_key(&(topic.clone(), Some(sender)))
            || inner.live.contains_key(&(topic.clone(), None))
    }

    /// Reopen a topic for every sender
    pub(crate) fn reopen(&self, topic: &Topic) {
        self.inner.lock().live.retain(|(t, _), _| t != topic);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_per_sender_and_globally() {
        let closed = ClosedTopics::new(16);
        let a = NodeId::random();
        let b = NodeId::random();

        closed.close(Topic::User, Some(a));
        assert!(closed.is_closed(&Topic::User, a));
        assert!(!closed.is_closed(&Topic::User, b));

        closed.close(Topic::Job, None);
        assert!(closed.is_closed(&Topic::Job, a));
        assert!(closed.is_closed(&Topic::Job, b));

        closed.reopen(&Topic::Job);
        assert!(!closed.is_closed(&Topic::Job, a));
    }

    #[test]
    fn test_oldest_evicted_first() {
        let closed = ClosedTopics::new(2);
        let n = NodeId::random();

        closed.close(Topic::custom(b"1".to_vec()), Some(n));
        closed.close(Topic::custom(b"2".to_vec()), Some(n));
        closed.close(Topic::custom(b"3".to_vec()), Some(n));

        assert_eq!(closed.len(), 2);
        assert!(!closed.is_closed(&Topic::custom(b"1".to_vec()), n));
        assert!(closed.is_closed(&Topic::custom(b"2".to_vec()), n));
        assert!(closed.is_closed(&Topic::custom(b"3".to_vec()), n));
    }

    #[test]
    fn test_reclosed_key_survives_eviction_of_its_old_slot() {
        let closed = ClosedTopics::new(2);
        let n = NodeId::random();
        let t1 = Topic::custom(b"1".to_vec());
        let t2 = Topic::custom(b"2".to_vec());
        let t3 = Topic::custom(b"3".to_vec());

        closed.close(t1.clone(), Some(n));
        closed.close(t2.clone(), Some(n));
        // Refresh t1; its first slot is now stale
        closed.close(t1.clone(), Some(n));
        closed.close(t3.clone(), Some(n));

        assert!(closed.is_closed(&t1, n));
        assert!(!closed.is_closed(&t2, n));
        assert!(closed.is_closed(&t3, n));
    }
}
