//! Fixed-size pool of persistent worker threads draining a [`WorkQueue`].
//!
//! Each worker blocks in [`WorkQueue::pop`], runs one [`Job::step`] of the item it
//! receives and acts on the returned [`Step`]: finished jobs are dropped, requeued
//! jobs go to the back of the queue and deferred jobs into the queue's delay set.
//! The worker never blocks on behalf of a job between steps.
//!
//! # Shutdown
//!
//! `shutdown` raises the shutdown flag and pushes exactly one [`Dispatch::Stop`]
//! sentinel per worker. Jobs dequeued after the flag is raised, jobs that ask to
//! be requeued after it, and jobs whose step panics are handed to the rejection
//! handler instead of being run. The last worker to exit drains anything still
//! queued into the rejection handler.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::work_queue::{Dispatch, WorkQueue};

/// Used to give pools without an explicit name a unique thread prefix.
static POOL_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// What a job wants after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The job reached a terminal state and delivered its outcome.
    Finished,
    /// Run another step as soon as a worker is free.
    Requeue,
    /// Run another step once the delay has elapsed.
    Defer(Duration),
}

/// A unit of work advanced one step per dispatch.
pub trait Job: Send + 'static {
    /// Execute one step.
    fn step(&mut self) -> Step;
}

impl<J: Job + ?Sized> Job for Box<J> {
    fn step(&mut self) -> Step {
        (**self).step()
    }
}

/// Receives jobs the pool will not run.
pub type RejectionHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Errors that can occur when starting a `WorkerPool`.
#[derive(Debug)]
pub enum PoolError {
    /// Configuration validation failed.
    InvalidConfig(String),
    /// The pool has been shut down.
    PoolShutdown,
    /// A worker thread could not be spawned.
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Statistics about pool activity.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of worker threads started.
    pub worker_count: usize,
    /// Items currently queued, ready or delayed.
    pub queued: usize,
    /// Steps executed.
    pub steps: u64,
    /// Steps that ended in a requeue.
    pub requeued: u64,
    /// Steps that ended in a deferral.
    pub deferred: u64,
    /// Jobs handed to the rejection handler.
    pub rejected: u64,
    /// Steps that panicked.
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    steps: AtomicU64,
    requeued: AtomicU64,
    deferred: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

/// State shared between the pool handle and its workers.
struct PoolShared<T> {
    queue: Arc<WorkQueue<T>>,
    shutdown: AtomicBool,
    live_workers: AtomicUsize,
    rejection: RwLock<Option<RejectionHandler<T>>>,
    counters: PoolCounters,
}

impl<T: Job> PoolShared<T> {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn reject(&self, job: T) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let handler = self.rejection.read().clone();
        match handler {
            Some(handler) => handler(job),
            None => warn!("job rejected with no rejection handler installed; dropping"),
        }
    }

    fn reject_leftovers(&self) {
        let leftovers = self.queue.drain();
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "rejecting jobs left in queue after shutdown");
        }
        for job in leftovers {
            self.reject(job);
        }
    }
}

/// Fixed pool of worker threads.
pub struct WorkerPool<T: Job> {
    shared: Arc<PoolShared<T>>,
    worker_count: usize,
    name_prefix: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Job> WorkerPool<T> {
    /// Create a pool over `queue`. No threads are started until
    /// [`prestart_all`](Self::prestart_all).
    ///
    /// `worker_count` of `None` uses five threads per CPU, the usual sizing for
    /// I/O-bound work.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `worker_count` is zero.
    pub fn new(
        queue: Arc<WorkQueue<T>>,
        worker_count: Option<usize>,
        name_prefix: Option<&str>,
    ) -> Result<Self, PoolError> {
        let worker_count = worker_count.unwrap_or_else(|| num_cpus::get() * 5);
        if worker_count == 0 {
            return Err(PoolError::InvalidConfig(
                "worker_count must be greater than 0".into(),
            ));
        }
        let name_prefix = name_prefix.map_or_else(
            || format!("detect-pool-{}", POOL_COUNTER.fetch_add(1, Ordering::Relaxed)),
            str::to_string,
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                queue,
                shutdown: AtomicBool::new(false),
                live_workers: AtomicUsize::new(0),
                rejection: RwLock::new(None),
                counters: PoolCounters::default(),
            }),
            worker_count,
            name_prefix,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Install the handler receiving jobs the pool will not run.
    pub fn set_rejection_handler(&self, handler: RejectionHandler<T>) {
        *self.shared.rejection.write() = Some(handler);
    }

    /// Start every worker thread. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// - `PoolError::PoolShutdown` if the pool was already shut down
    /// - `PoolError::Internal` if a thread could not be spawned; threads
    ///   already started keep running until shutdown
    pub fn prestart_all(&self) -> Result<(), PoolError> {
        if self.shared.is_shutdown() {
            return Err(PoolError::PoolShutdown);
        }
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for worker_id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            shared.live_workers.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("{}-{worker_id}", self.name_prefix))
                .spawn(move || worker_loop(worker_id, &shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                    error!(worker_id = worker_id, error = %e, "failed to spawn worker thread");
                    return Err(PoolError::Internal(format!("failed to spawn worker: {e}")));
                }
            }
        }
        info!(
            worker_count = self.worker_count,
            prefix = %self.name_prefix,
            "worker pool started"
        );
        Ok(())
    }

    /// Queue a job for its first step. After shutdown the job is rejected.
    pub fn execute(&self, job: T) {
        if self.shared.is_shutdown() {
            self.shared.reject(job);
            return;
        }
        self.shared.queue.push_back(job);
    }

    /// The queue this pool drains.
    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue<T>> {
        &self.shared.queue
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Configured number of workers.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            worker_count: self.workers.lock().len(),
            queued: self.shared.queue.len(),
            steps: c.steps.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool: one sentinel per worker, then optionally join them.
    ///
    /// Safe to call repeatedly; a later call with `wait = true` joins workers
    /// left running by an earlier `wait = false` call. A worker calling this on
    /// its own pool is not joined.
    pub fn shutdown(&self, wait: bool) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            let started = self.workers.lock().len();
            info!(worker_count = started, "shutting down worker pool");
            if started == 0 {
                self.shared.reject_leftovers();
            }
            for _ in 0..started {
                self.shared.queue.push_stop();
            }
        }

        if !wait {
            return;
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for (idx, handle) in handles.into_iter().enumerate() {
            if handle.thread().id() == current {
                debug!(worker_id = idx, "not joining the calling worker");
                continue;
            }
            if handle.join().is_err() {
                warn!(worker_id = idx, "worker thread panicked");
            }
        }
        debug!("worker pool joined");
    }
}

impl<T: Job> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // Signal without joining; workers exit on their own and are not waited for.
        if !self.shared.is_shutdown() {
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
            self.shutdown(false);
        }
    }
}

fn worker_loop<T: Job>(worker_id: usize, shared: &PoolShared<T>) {
    debug!(worker_id = worker_id, "worker thread started");

    loop {
        let mut job = match shared.queue.pop() {
            Dispatch::Run(job) => job,
            Dispatch::Stop => break,
        };

        if shared.is_shutdown() {
            shared.reject(job);
            continue;
        }

        shared.counters.steps.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.step()));

        match outcome {
            Ok(Step::Finished) => {}
            Ok(Step::Requeue) => {
                shared.counters.requeued.fetch_add(1, Ordering::Relaxed);
                if shared.is_shutdown() {
                    shared.reject(job);
                } else {
                    shared.queue.push_back(job);
                }
            }
            Ok(Step::Defer(delay)) => {
                shared.counters.deferred.fetch_add(1, Ordering::Relaxed);
                if shared.is_shutdown() {
                    shared.reject(job);
                } else {
                    shared.queue.push_after(job, delay);
                }
            }
            Err(payload) => {
                shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker_id = worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "job step panicked"
                );
                shared.reject(job);
            }
        }
    }

    if shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.reject_leftovers();
    }
    debug!(worker_id = worker_id, "worker thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    /// Job that needs `remaining` extra steps before finishing.
    struct Countdown {
        id: u32,
        remaining: u32,
        done: crossbeam_channel::Sender<u32>,
    }

    impl Job for Countdown {
        fn step(&mut self) -> Step {
            if self.remaining == 0 {
                let _ = self.done.send(self.id);
                return Step::Finished;
            }
            self.remaining -= 1;
            if self.remaining % 2 == 0 {
                Step::Requeue
            } else {
                Step::Defer(Duration::from_millis(5))
            }
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let queue = Arc::new(WorkQueue::<Countdown>::new());
        assert!(matches!(
            WorkerPool::new(queue, Some(0), None),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_multi_step_jobs_complete() {
        let (tx, rx) = unbounded();
        let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(3), Some("t-multi")).unwrap();
        pool.prestart_all().unwrap();

        for id in 0..20 {
            pool.execute(Countdown {
                id,
                remaining: id % 5,
                done: tx.clone(),
            });
        }
        let mut done: Vec<u32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        done.sort_unstable();
        assert_eq!(done, (0..20).collect::<Vec<_>>());

        let stats = pool.stats();
        assert_eq!(stats.worker_count, 3);
        assert!(stats.requeued > 0);
        assert!(stats.deferred > 0);
        pool.shutdown(true);
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let (tx, rx) = unbounded();
        let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(1), None).unwrap();
        let rejected = Arc::new(AtomicUsize::new(0));
        {
            let rejected = Arc::clone(&rejected);
            pool.set_rejection_handler(Arc::new(move |_job: Countdown| {
                rejected.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.prestart_all().unwrap();
        pool.shutdown(true);

        pool.execute(Countdown { id: 1, remaining: 0, done: tx });
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert!(matches!(pool.prestart_all(), Err(PoolError::PoolShutdown)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
