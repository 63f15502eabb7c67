/*!
 * Worker Thread Pool
 *
 * Process-wide pool executing every asynchronous work item: map
 * preparation, map closing, page prefaulting and bind stages. Jobs travel
 * over a flume channel; each job runs under `catch_unwind` so a panicking
 * work item is logged without taking its worker down.
 */

use crate::core::limits::{MAX_WORKER_THREADS, WORKER_THREAD_PREFIX};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Fixed-size worker pool
pub struct ThreadPool {
    sender: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    panics: Arc<AtomicU64>,
}

impl ThreadPool {
    /// Create a pool with `threads` workers (0 means one per processor)
    pub fn new(threads: usize) -> Self {
        let threads = match threads {
            0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        }
        .clamp(1, MAX_WORKER_THREADS);

        let (sender, receiver) = flume::unbounded::<Job>();
        let pending = Arc::new(Pending::default());
        let panics = Arc::new(AtomicU64::new(0));

        let workers = (0..threads)
            .filter_map(|index| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                let panics = Arc::clone(&panics);
                thread::Builder::new()
                    .name(format!("{}-{}", WORKER_THREAD_PREFIX, index))
                    .spawn(move || worker_loop(receiver, pending, panics))
                    .map_err(|e| error!(error = %e, "failed to spawn worker thread"))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!(threads = workers.len(), "thread pool started");

        Self {
            sender: Some(sender),
            workers,
            pending,
            panics,
        }
    }

    /// Number of live worker threads
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` for asynchronous execution
    ///
    /// Returns `false` if the pool is shutting down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        *self.pending.count.lock() += 1;
        if sender.send(Box::new(job)).is_err() {
            complete_one(&self.pending);
            return false;
        }
        true
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Jobs that panicked since the pool started
    pub fn panicked_jobs(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Block until no job is queued or running
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Like `wait_idle` with an upper bound; returns `true` if idle
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(receiver: flume::Receiver<Job>, pending: Arc<Pending>, panics: Arc<AtomicU64>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            panics.fetch_add(1, Ordering::Relaxed);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic>".to_string());
            error!(panic = %message, "work item panicked");
        }
        complete_one(&pending);
    }
}

fn complete_one(pending: &Pending) {
    let mut count = pending.count.lock();
    *count = count.saturating_sub(1);
    if *count == 0 {
        pending.idle.notify_all();
    }
}
