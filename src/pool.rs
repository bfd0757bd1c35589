//! Priority-ordered thread pool with lazy worker growth.
//!
//! Tasks carry `(priority, sequence)` and are served highest priority first,
//! FIFO within equal priority. Workers are plain OS threads, spawned only
//! when a task arrives while no worker is idle and the live count is still
//! below the configured maximum. Shutdown drains already-queued tasks before
//! the workers exit.
//!
//! The process-wide instance is [`ThreadPool::global`], sized to the number
//! of hardware threads; servers dispatch per-frame handlers through it so
//! they never block the reactor thread.

use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::{ForgewireError, Result};

type Thunk = Box<dyn FnOnce() + Send>;

struct Job {
    priority: i32,
    seq: u64,
    thunk: Thunk,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    tasks: BinaryHeap<Job>,
    stopped: bool,
    idle: usize,
    live: usize,
    seq: u64,
    handles: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
    max_workers: usize,
}

/// Handle to a pooled task's result.
///
/// `wait` returns [`ForgewireError::TaskAbandoned`] when the task will never
/// produce a value: the pool was stopped at submission time, or the thunk
/// panicked.
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| ForgewireError::TaskAbandoned)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Result<T> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| ForgewireError::TaskAbandoned)
    }
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a pool that grows up to `max_workers` threads (minimum 1).
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        tracing::debug!(max_workers, "thread pool created");
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: BinaryHeap::new(),
                    stopped: false,
                    idle: 0,
                    live: 0,
                    seq: 0,
                    handles: Vec::new(),
                }),
                cv: Condvar::new(),
                max_workers,
            }),
        }
    }

    /// The process-wide pool, created on first use and sized to the number
    /// of hardware threads.
    pub fn global() -> &'static ThreadPool {
        static POOL: OnceLock<ThreadPool> = OnceLock::new();
        POOL.get_or_init(|| {
            let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            ThreadPool::new(workers)
        })
    }

    /// Queue a task. Higher `priority` runs first; ties are FIFO.
    pub fn spawn<F, T>(&self, priority: i32, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let thunk: Thunk = Box::new(move || {
            let _ = tx.send(f());
        });

        let mut state = self.shared.state.lock();
        if state.stopped {
            tracing::error!("task submitted to a stopped thread pool");
            // The thunk (and with it the sender) drops here, so the handle
            // reports the task as abandoned.
            return TaskHandle { rx };
        }

        let seq = state.seq;
        state.seq += 1;
        state.tasks.push(Job { priority, seq, thunk });
        tracing::trace!(priority, seq, "task queued");

        if state.idle == 0 && state.live < self.shared.max_workers {
            state.live += 1;
            let worker_id = state.live;
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("forgewire-worker-{worker_id}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            state.handles.push(handle);
        }
        drop(state);

        self.shared.cv.notify_one();
        TaskHandle { rx }
    }

    /// Stop accepting tasks, let workers drain the queue, then join them.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            std::mem::take(&mut state.handles)
        };
        self.shared.cv.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("thread pool closed");
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    tracing::trace!("worker started");
    loop {
        let job = {
            let mut state = shared.state.lock();
            state.idle += 1;
            while !state.stopped && state.tasks.is_empty() {
                shared.cv.wait(&mut state);
            }
            state.idle -= 1;

            // Stop plus an empty queue is the exit predicate: queued work
            // is drained before the worker leaves.
            if state.stopped && state.tasks.is_empty() {
                state.live -= 1;
                tracing::trace!("worker exited");
                return;
            }
            match state.tasks.pop() {
                Some(job) => job,
                None => continue,
            }
        };

        if catch_unwind(AssertUnwindSafe(job.thunk)).is_err() {
            tracing::error!(priority = job.priority, seq = job.seq, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_a_task() {
        let pool = ThreadPool::new(2);
        let handle = pool.spawn(0, || 21 * 2);
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_priority_order_with_single_worker() {
        let pool = ThreadPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the remaining tasks queue up and the
        // heap, not arrival order, decides execution order.
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = pool.spawn(100, move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        started_rx.recv().unwrap();

        let mut handles = Vec::new();
        for &priority in &[2, 0, 1, 0, 2] {
            let order = Arc::clone(&order);
            handles.push(pool.spawn(priority, move || {
                order.lock().push(priority);
            }));
        }
        assert_eq!(pool.queued_len(), 5);

        gate_tx.send(()).unwrap();
        gate.wait().unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }

        assert_eq!(*order.lock(), vec![2, 2, 1, 0, 0]);
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let pool = ThreadPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate = pool.spawn(0, move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        started_rx.recv().unwrap();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let order = Arc::clone(&order);
            handles.push(pool.spawn(5, move || {
                order.lock().push(i);
            }));
        }

        gate_tx.send(()).unwrap();
        gate.wait().unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }

        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_stopped_pool_abandons_tasks() {
        let pool = ThreadPool::new(1);
        pool.shutdown();

        let handle = pool.spawn(0, || 1);
        assert!(matches!(handle.wait(), Err(ForgewireError::TaskAbandoned)));
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let pool = ThreadPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let _gate = pool.spawn(0, move || {
            let _ = gate_rx.recv();
        });
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.spawn(0, move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_worker_survives_panicking_task() {
        let pool = ThreadPool::new(1);
        let panicked = pool.spawn(0, || panic!("boom"));
        assert!(matches!(panicked.wait(), Err(ForgewireError::TaskAbandoned)));

        let handle = pool.spawn(0, || "still alive");
        assert_eq!(handle.wait().unwrap(), "still alive");
    }

    #[test]
    fn test_lazy_growth_caps_at_max() {
        let pool = ThreadPool::new(2);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate_rx = Arc::clone(&gate_rx);
            handles.push(pool.spawn(0, move || {
                let _ = gate_rx.lock().recv_timeout(Duration::from_millis(200));
            }));
        }
        assert!(pool.shared.state.lock().live <= 2);

        for _ in 0..6 {
            let _ = gate_tx.send(());
        }
        for handle in handles {
            handle.wait().unwrap();
        }
    }

    #[test]
    fn test_wait_timeout() {
        let pool = ThreadPool::new(1);
        let handle = pool.spawn(0, || {
            thread::sleep(Duration::from_millis(50));
            7
        });
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
