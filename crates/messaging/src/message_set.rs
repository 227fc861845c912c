//! Ordered reassembly buffer for one (topic, sender) pair.
//!
//! Messages are kept sorted by sequence number and released to listeners
//! only once they are contiguous with the last delivered one. Draining is
//! serialized by a reservation; whoever holds it must re-check the
//! `changed` flag after releasing and drain again if it is set, because a
//! concurrent `add` that failed to reserve relies on the holder to pick its
//! message up.

use gridcore_common::NodeId;
use gridcore_protocol::{IoPolicy, Message, Topic};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Sequence numbers given up on after a skip-on-timeout, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedRange {
    pub from: u64,
    pub to: u64,
}

impl SkippedRange {
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Messages released by one unwind pass
#[derive(Debug, Default)]
pub(crate) struct Unwound {
    pub(crate) messages: Vec<Message>,
    pub(crate) skipped: Option<SkippedRange>,
}

struct SetState {
    pending: BTreeMap<u64, (Message, Instant)>,
    next: u64,
    /// Receipt time of the last delivered message
    last_ts: Instant,
}

pub(crate) struct MessageSet {
    topic: Topic,
    sender: NodeId,
    policy: IoPolicy,
    timeout: Duration,
    skip_on_timeout: bool,
    reserved: AtomicBool,
    changed: AtomicBool,
    removed: AtomicBool,
    state: Mutex<SetState>,
}

/// Exclusive right to drain a message set; released on drop.
pub(crate) struct Reservation<'a> {
    set: &'a MessageSet,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set.release();
    }
}

impl MessageSet {
    pub(crate) fn new(
        topic: Topic,
        sender: NodeId,
        policy: IoPolicy,
        timeout: Duration,
        skip_on_timeout: bool,
    ) -> Self {
        Self {
            topic,
            sender,
            policy,
            timeout,
            skip_on_timeout,
            reserved: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            state: Mutex::new(SetState {
                pending: BTreeMap::new(),
                next: 1,
                last_ts: Instant::now(),
            }),
        }
    }

    pub(crate) fn topic(&self) -> &Topic {
        &self.topic
    }

    pub(crate) fn sender(&self) -> NodeId {
        self.sender
    }

    pub(crate) fn policy(&self) -> IoPolicy {
        self.policy
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn skip_on_timeout(&self) -> bool {
        self.skip_on_timeout
    }

    /// Buffer a message; stale or duplicate sequence numbers are dropped.
    pub(crate) fn add(&self, sequence: u64, message: Message) -> bool {
        let mut state = self.state.lock();

        if sequence < state.next || state.pending.contains_key(&sequence) {
            tracing::warn!(
                topic = %self.topic,
                sender = %self.sender,
                seq = sequence,
                next = state.next,
                "received stale or duplicate ordered message (will ignore)"
            );
            return false;
        }

        state.pending.insert(sequence, (message, Instant::now()));
        self.changed.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) fn try_reserve(&self) -> Option<Reservation<'_>> {
        self.reserved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Reservation { set: self })
    }

    fn release(&self) {
        let was_reserved = self.reserved.swap(false, Ordering::SeqCst);
        assert!(was_reserved, "message set reservation released twice");
    }

    /// Whether messages were added since the last unwind
    pub(crate) fn changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Take every message that is next in sequence.
    ///
    /// With `force`, a gap before the first buffered message is given up on
    /// and each missing sequence number is reported once.
    pub(crate) fn unwind(&self, _reservation: &Reservation<'_>, force: bool) -> Unwound {
        let mut state = self.state.lock();
        self.changed.store(false, Ordering::SeqCst);

        let mut unwound = Unwound::default();
        let mut force = force;

        while let Some((&sequence, _)) = state.pending.first_key_value() {
            if sequence != state.next {
                if !force {
                    break;
                }

                let range = SkippedRange {
                    from: state.next,
                    to: sequence - 1,
                };
                for missing in range.from..=range.to {
                    tracing::warn!(
                        topic = %self.topic,
                        sender = %self.sender,
                        seq = missing,
                        "ordered message timed out, skipping it"
                    );
                }
                unwound.skipped = Some(range);
            }
            force = false;

            if let Some((sequence, (message, received))) = state.pending.pop_first() {
                state.next = sequence + 1;
                state.last_ts = received;
                unwound.messages.push(message);
            }
        }

        unwound
    }

    /// Time since the last delivery while messages wait behind a gap
    pub(crate) fn idle_time(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.pending.is_empty() {
            None
        } else {
            Some(state.last_ts.elapsed())
        }
    }

    pub(crate) fn next_expected(&self) -> u64 {
        self.state.lock().next
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(skip: bool) -> MessageSet {
        MessageSet::new(
            Topic::User,
            NodeId::random(),
            IoPolicy::Public,
            Duration::from_millis(10),
            skip,
        )
    }

    fn bodies(unwound: &Unwound) -> Vec<u8> {
        unwound
            .messages
            .iter()
            .map(|m| match m {
                Message::User(u) => u.body[0],
                _ => 0,
            })
            .collect()
    }

    #[test]
    fn test_gap_holds_back_later_messages() {
        let set = set(false);
        assert!(set.add(1, Message::user(vec![1])));
        assert!(set.add(3, Message::user(vec![3])));

        let reservation = set.try_reserve().unwrap();
        let unwound = set.unwind(&reservation, false);
        assert_eq!(bodies(&unwound), vec![1]);
        assert_eq!(set.next_expected(), 2);
        assert_eq!(set.pending_len(), 1);

        set.add(2, Message::user(vec![2]));
        let unwound = set.unwind(&reservation, false);
        assert_eq!(bodies(&unwound), vec![2, 3]);
        assert_eq!(set.next_expected(), 4);
    }

    #[test]
    fn test_stale_and_duplicate_dropped() {
        let set = set(false);
        set.add(1, Message::user(vec![1]));
        set.add(3, Message::user(vec![3]));
        assert!(!set.add(3, Message::user(vec![3])));

        let reservation = set.try_reserve().unwrap();
        set.unwind(&reservation, false);
        assert!(!set.add(1, Message::user(vec![1])));
    }

    #[test]
    fn test_single_reservation() {
        let set = set(false);
        let first = set.try_reserve();
        assert!(first.is_some());
        assert!(set.try_reserve().is_none());
        drop(first);
        assert!(set.try_reserve().is_some());
    }

    #[test]
    fn test_changed_flag_cleared_by_unwind() {
        let set = set(false);
        set.add(2, Message::user(vec![2]));
        assert!(set.changed());

        let reservation = set.try_reserve().unwrap();
        set.unwind(&reservation, false);
        assert!(!set.changed());

        set.add(1, Message::user(vec![1]));
        assert!(set.changed());
    }

    #[test]
    fn test_forced_unwind_skips_gap_once() {
        let set = set(true);
        set.add(1, Message::user(vec![1]));
        set.add(4, Message::user(vec![4]));
        set.add(7, Message::user(vec![7]));

        let reservation = set.try_reserve().unwrap();
        let unwound = set.unwind(&reservation, false);
        assert_eq!(bodies(&unwound), vec![1]);

        // Only the first gap is skipped by one forced pass
        let unwound = set.unwind(&reservation, true);
        assert_eq!(bodies(&unwound), vec![4]);
        assert_eq!(unwound.skipped, Some(SkippedRange { from: 2, to: 3 }));
        assert_eq!(unwound.skipped.unwrap().len(), 2);
        assert_eq!(set.next_expected(), 5);

        let unwound = set.unwind(&reservation, true);
        assert_eq!(bodies(&unwound), vec![7]);
        assert_eq!(unwound.skipped, Some(SkippedRange { from: 5, to: 6 }));

        // Nothing left to skip; next expected never moves backwards
        let unwound = set.unwind(&reservation, true);
        assert!(unwound.messages.is_empty());
        assert!(unwound.skipped.is_none());
        assert_eq!(set.next_expected(), 8);
    }

    #[test]
    fn test_idle_time_only_with_pending() {
        let set = set(true);
        assert!(set.idle_time().is_none());
        set.add(2, Message::user(vec![2]));
        assert!(set.idle_time().is_some());
    }
}
