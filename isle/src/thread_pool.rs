//! Worker pool used to run native port handlers off the posting thread.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Upper bound of live worker threads.
    pub max_workers: usize,
    /// A worker idle for this long exits.
    pub retire_after_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            retire_after_idle: Duration::from_secs(5),
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    has_work: Condvar,
    should_stop: AtomicBool,
    idle: AtomicUsize,
    live: AtomicUsize,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    config: PoolConfig,
    id_gen: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                has_work: Condvar::new(),
                should_stop: AtomicBool::new(false),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            }),
            config,
            id_gen: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Queues `task`. Returns false once the pool is shutting down.
    pub fn run(&self, task: Task) -> bool {
        if self.shared.should_stop.load(Ordering::Acquire) {
            return false;
        }
        self.shared.queue.lock().push_back(task);
        if self.shared.idle.load(Ordering::Acquire) == 0
            && self.shared.live.load(Ordering::Acquire) < self.config.max_workers
        {
            self.spawn_worker();
        }
        self.shared.has_work.notify_one();
        true
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    fn spawn_worker(&self) {
        let id = WorkerId(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let shared = Arc::clone(&self.shared);
        let idle_timeout = self.config.retire_after_idle;
        shared.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("isle-worker-{}", id.0))
            .spawn(move || worker_loop(shared, id, idle_timeout));
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(err) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                log::error!("failed to spawn pool worker: {}", err);
            }
        }
    }

    /// Stops accepting tasks, drains the queue and joins every worker.
    pub fn shutdown(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.has_work.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("pool worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, id: WorkerId, idle_timeout: Duration) {
    log::trace!("worker {} started", id.0);
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.should_stop.load(Ordering::Acquire) {
                    break None;
                }
                shared.idle.fetch_add(1, Ordering::AcqRel);
                let timed_out = shared.has_work.wait_for(&mut queue, idle_timeout).timed_out();
                shared.idle.fetch_sub(1, Ordering::AcqRel);
                if timed_out && queue.is_empty() {
                    break None;
                }
            }
        };
        match task {
            Some(task) => task(),
            None => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
    log::trace!("worker {} exiting", id.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_on_named_workers() {
        let pool = ThreadPool::new(PoolConfig::default());
        let (tx, rx) = mpsc::channel();
        assert!(pool.run(Box::new(move || {
            let name = thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        })));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("isle-worker-"));
    }

    #[test]
    fn shutdown_drains_queue() {
        let pool = ThreadPool::new(PoolConfig {
            max_workers: 2,
            retire_after_idle: Duration::from_millis(50),
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.run(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert!(!pool.run(Box::new(|| {})));
    }

    #[test]
    fn idle_workers_retire() {
        let pool = ThreadPool::new(PoolConfig {
            max_workers: 1,
            retire_after_idle: Duration::from_millis(10),
        });
        let (tx, rx) = mpsc::channel();
        pool.run(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.live_workers() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.live_workers(), 0);
    }
}
