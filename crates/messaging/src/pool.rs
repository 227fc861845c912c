//! Worker pools, one per I/O policy.
//!
//! Listener callbacks are synchronous and may block. On a multi-thread
//! runtime each task runs under `block_in_place`, so a blocked listener
//! parks its own worker thread only and the runtime keeps making progress.

use crate::config::MessagingConfig;
use gridcore_protocol::IoPolicy;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// A task the pool did not accept, handed back to the caller
pub(crate) enum Rejected {
    /// Every worker is busy and the queue is full
    Saturated(Task),
    /// The pool was shut down
    Closed(Task),
}

/// Fixed number of workers draining a bounded queue.
pub(crate) struct WorkerPool {
    policy: IoPolicy,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn start(policy: IoPolicy, size: usize, capacity: usize, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let blocking = runtime.runtime_flavor() == RuntimeFlavor::MultiThread;

        let workers = (0..size)
            .map(|idx| runtime.spawn(worker_loop(policy, idx, rx.clone(), blocking)))
            .collect();

        Self {
            policy,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task; hands it back when the pool is saturated or closed.
    pub(crate) fn execute(&self, task: Task) -> std::result::Result<(), Rejected> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.try_send(task).map_err(|e| match e {
                mpsc::error::TrySendError::Full(task) => Rejected::Saturated(task),
                mpsc::error::TrySendError::Closed(task) => Rejected::Closed(task),
            }),
            None => Err(Rejected::Closed(task)),
        }
    }

    /// Stop accepting tasks; workers exit once the queue is drained.
    fn close(&self) -> Vec<JoinHandle<()>> {
        self.sender.lock().take();
        std::mem::take(&mut *self.workers.lock())
    }
}

async fn worker_loop(
    policy: IoPolicy,
    idx: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    blocking: bool,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(task) = task else {
            tracing::trace!(policy = policy.as_str(), worker = idx, "worker pool closed");
            break;
        };

        let result = if blocking {
            tokio::task::block_in_place(|| catch_unwind(AssertUnwindSafe(task)))
        } else {
            catch_unwind(AssertUnwindSafe(task))
        };
        if result.is_err() {
            tracing::error!(
                policy = policy.as_str(),
                worker = idx,
                "message processing task panicked"
            );
        }
    }
}

/// The pools of one substrate, indexed by policy ordinal.
pub(crate) struct Pools {
    pools: Vec<WorkerPool>,
}

impl Pools {
    pub(crate) fn start(config: &MessagingConfig, runtime: &Handle) -> Self {
        let pools = IoPolicy::ALL
            .iter()
            .map(|&policy| {
                WorkerPool::start(
                    policy,
                    config.pool_size(policy),
                    config.pool_queue_capacity,
                    runtime,
                )
            })
            .collect();
        Self { pools }
    }

    pub(crate) fn get(&self, policy: IoPolicy) -> &WorkerPool {
        &self.pools[policy.ordinal() as usize]
    }

    /// Close every pool and wait for the workers to drain their queues.
    pub(crate) async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.pools.iter().flat_map(|p| p.close()).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("worker task ended abnormally: {}", e);
            }
        }
    }
}

impl WorkerPool {
    pub(crate) fn policy(&self) -> IoPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tasks_run_on_workers() {
        let pools = Pools::start(&MessagingConfig::for_testing(), &Handle::current());
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            let task: Task = Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert!(pools.get(IoPolicy::Public).execute(task).is_ok());
        }

        pools.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_pool_returns_task() {
        let config = MessagingConfig {
            management_pool_size: 1,
            pool_queue_capacity: 1,
            ..MessagingConfig::for_testing()
        };
        let pools = Pools::start(&config, &Handle::current());
        let pool = pools.get(IoPolicy::Management);
        assert_eq!(pool.policy(), IoPolicy::Management);

        // Park the single worker
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker: Task = Box::new(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        assert!(pool.execute(blocker).is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One slot in the queue, then saturation
        assert!(pool.execute(Box::new(|| {})).is_ok());
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(Rejected::Saturated(_))
        ));

        release_tx.send(()).unwrap();
        pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pools = Pools::start(&MessagingConfig::for_testing(), &Handle::current());
        pools.shutdown().await;
        assert!(matches!(
            pools.get(IoPolicy::System).execute(Box::new(|| {})),
            Err(Rejected::Closed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_task_does_not_stall_runtime() {
        let config = MessagingConfig {
            management_pool_size: 1,
            ..MessagingConfig::for_testing()
        };
        let pools = Pools::start(&config, &Handle::current());

        // Occupies the only runtime worker until released from another task
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let blocker: Task = Box::new(move || {
            let released = release_rx.recv_timeout(Duration::from_secs(5)).is_ok();
            let _ = done_tx.send(released);
        });
        assert!(pools.get(IoPolicy::Management).execute(blocker).is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let releaser = tokio::spawn(async move { release_tx.send(()).is_ok() });
        let sent = tokio::time::timeout(Duration::from_secs(2), releaser)
            .await
            .expect("runtime stalled behind a blocking task")
            .unwrap();
        assert!(sent);
        assert!(done_rx.await.unwrap());

        pools.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_worker_alive() {
        let config = MessagingConfig {
            affinity_pool_size: 1,
            ..MessagingConfig::for_testing()
        };
        let pools = Pools::start(&config, &Handle::current());
        let count = Arc::new(AtomicUsize::new(0));

        assert!(
            pools
                .get(IoPolicy::Affinity)
                .execute(Box::new(|| panic!("boom")))
                .is_ok()
        );
        let c = count.clone();
        assert!(
            pools
                .get(IoPolicy::Affinity)
                .execute(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok()
        );

        pools.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
