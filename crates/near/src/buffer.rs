//! Fixed-capacity ring that hands back what it overwrites.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrent circular buffer with power-of-two capacity.
///
/// Once full, every [`CircularBuffer::add`] overwrites the oldest slot and
/// returns the item it displaced. Each item is returned at most once.
pub struct CircularBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    mask: usize,
    next: AtomicUsize,
}

impl<T> CircularBuffer<T> {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            mask: capacity - 1,
            next: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store `item`; returns the evicted item once the buffer has wrapped.
    pub fn add(&self, item: T) -> Option<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) & self.mask;
        self.slots[idx].lock().replace(item)
    }

    /// Items currently held
    pub fn len(&self) -> usize {
        self.next.load(Ordering::Relaxed).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
