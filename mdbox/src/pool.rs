//! Fixed-size worker pool for split/save/load tasks.
//!
//! Tasks are plain blocking closures drained in FIFO order from a
//! crossbeam channel. Task dependencies are expressed by submission
//! order: a child split task is only submitted after its parent split
//! produced that child. There is no cooperative scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

use crate::errors::{MdError, MdResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared cancellation flag checked between event batches by long-running
/// split and save tasks.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests that in-flight work stop at the next batch boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fails with `Cancelled` once the token is set.
    pub fn check(&self) -> MdResult<()> {
        if self.is_cancelled() {
            Err(MdError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cloneable submission handle, usable from inside running tasks to
/// enqueue follow-up work.
#[derive(Clone)]
pub struct TaskSpawner {
    sender: Sender<Job>,
}

impl TaskSpawner {
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        // Send only fails after the pool shut down; jobs submitted during
        // teardown are dropped.
        let _ = self.sender.send(Box::new(job));
    }
}

/// A fixed set of worker threads draining one FIFO queue.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `workers` threads; the queue is unbounded.
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("mdbox-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        ThreadPool {
            sender: Some(sender),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    pub fn spawner(&self) -> TaskSpawner {
        TaskSpawner {
            sender: self
                .sender
                .as_ref()
                .expect("pool is shutting down")
                .clone(),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain the queue and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let barrier2 = barrier.clone();
        pool.execute(move || {
            barrier2.wait();
        });
        barrier.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            for _ in 0..50 {
                let counter = counter.clone();
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        // Drop joined the workers after the queue drained.
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_spawner_submits_from_inside_jobs() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let spawner = pool.spawner();
        let counter2 = counter.clone();
        let barrier2 = barrier.clone();
        pool.execute(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            let counter3 = counter2.clone();
            let barrier3 = barrier2.clone();
            spawner.execute(move || {
                counter3.fetch_add(1, Ordering::SeqCst);
                barrier3.wait();
            });
        });
        barrier.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_at_least_one_worker() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(MdError::Cancelled)));
    }
}
