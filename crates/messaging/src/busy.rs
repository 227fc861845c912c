//! Busy lock gating shutdown.
//!
//! Every send and inbound dispatch enters the lock; shutdown blocks it and
//! waits for the holders to leave.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
pub(crate) struct BusyLock {
    active: AtomicUsize,
    blocked: AtomicBool,
}

pub(crate) struct BusyGuard<'a> {
    lock: &'a BusyLock,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.lock.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BusyLock {
    /// Enter unless shutdown has begun
    pub(crate) fn enter(&self) -> Option<BusyGuard<'_>> {
        if self.blocked.load(Ordering::SeqCst) {
            return None;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = BusyGuard { lock: self };
        if self.blocked.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    /// Refuse new entries and wait (bounded) for current holders to leave.
    pub(crate) async fn block(&self, timeout: Duration) -> bool {
        self.blocked.store(true, Ordering::SeqCst);
        wait_for_zero(&self.active, timeout).await
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}

/// Wait until `counter` reaches zero or `timeout` elapses.
pub(crate) async fn wait_for_zero(counter: &AtomicUsize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while counter.load(Ordering::SeqCst) != 0 {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// Counts a unit of dispatched work until dropped.
pub(crate) struct WorkerGuard(pub(crate) Arc<AtomicUsize>);

impl WorkerGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
