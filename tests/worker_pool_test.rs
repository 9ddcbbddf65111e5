//! Integration tests for the work queue and worker pool.
//!
//! These tests cover:
//! - Multi-step jobs that requeue and defer themselves
//! - Delay-set ordering
//! - Shutdown: queued jobs are rejected, running jobs finish
//! - Panicking jobs do not kill workers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use detect_lot::core::{Dispatch, Job, Step, WorkQueue, WorkerPool};

// ============================================================================
// TEST JOBS
// ============================================================================

/// Job that optionally blocks on a gate, then reports its id.
struct GatedJob {
    id: u32,
    started: Option<Sender<u32>>,
    gate: Option<Receiver<()>>,
    done: Sender<u32>,
}

impl GatedJob {
    fn plain(id: u32, done: &Sender<u32>) -> Self {
        Self {
            id,
            started: None,
            gate: None,
            done: done.clone(),
        }
    }
}

impl Job for GatedJob {
    fn step(&mut self) -> Step {
        if let Some(started) = &self.started {
            let _ = started.send(self.id);
        }
        if let Some(gate) = &self.gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        let _ = self.done.send(self.id);
        Step::Finished
    }
}

/// Job that defers itself once by `delay`, then reports its id.
struct DeferOnce {
    id: u32,
    delay: Option<Duration>,
    done: Sender<u32>,
}

impl Job for DeferOnce {
    fn step(&mut self) -> Step {
        match self.delay.take() {
            Some(delay) => Step::Defer(delay),
            None => {
                let _ = self.done.send(self.id);
                Step::Finished
            }
        }
    }
}

/// Job that panics on its first step.
struct Explosive;

impl Job for Explosive {
    fn step(&mut self) -> Step {
        panic!("explosive job");
    }
}

fn counting_handler<T: Job>(pool: &WorkerPool<T>) -> Arc<AtomicUsize> {
    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&rejected);
    pool.set_rejection_handler(Arc::new(move |_job: T| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    rejected
}

// ============================================================================
// TESTS
// ============================================================================

/// Shutdown with K queued jobs rejects exactly those K; the running job finishes.
#[test]
fn test_shutdown_rejects_queued_jobs() {
    const QUEUED: u32 = 7;

    let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(1), Some("t-shutdown")).unwrap();
    let rejected = counting_handler(&pool);
    pool.prestart_all().unwrap();

    let (done_tx, done_rx) = unbounded();
    let (started_tx, started_rx) = bounded(1);
    let (gate_tx, gate_rx) = bounded(1);
    pool.execute(GatedJob {
        id: 0,
        started: Some(started_tx),
        gate: Some(gate_rx),
        done: done_tx.clone(),
    });
    assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

    for id in 1..=QUEUED {
        pool.execute(GatedJob::plain(id, &done_tx));
    }
    assert_eq!(pool.queue().len(), QUEUED as usize);

    pool.shutdown(false);
    gate_tx.send(()).unwrap();
    pool.shutdown(true);

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
    assert!(done_rx.try_recv().is_err());
    assert_eq!(rejected.load(Ordering::SeqCst), QUEUED as usize);
    assert_eq!(pool.stats().rejected, u64::from(QUEUED));
    assert!(pool.queue().is_empty());
}

/// Deferred jobs wait in the delay set without occupying the only worker.
#[test]
fn test_deferred_job_does_not_block_worker() {
    let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(1), Some("t-defer")).unwrap();
    pool.prestart_all().unwrap();
    let (tx, rx) = unbounded();

    let start = Instant::now();
    pool.execute(DeferOnce {
        id: 1,
        delay: Some(Duration::from_millis(100)),
        done: tx.clone(),
    });
    pool.execute(DeferOnce {
        id: 2,
        delay: None,
        done: tx,
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.stats().deferred, 1);
    pool.shutdown(true);
}

/// Jobs still waiting out a delay at shutdown are rejected by the last worker.
#[test]
fn test_delayed_leftovers_rejected_on_shutdown() {
    let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(2), None).unwrap();
    let rejected = counting_handler(&pool);
    pool.prestart_all().unwrap();
    let (tx, rx) = unbounded();

    for id in 0..3 {
        pool.execute(DeferOnce {
            id,
            delay: Some(Duration::from_secs(30)),
            done: tx.clone(),
        });
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.queue().delayed_len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pool.queue().delayed_len(), 3);

    pool.shutdown(true);
    assert_eq!(rejected.load(Ordering::SeqCst), 3);
    assert!(rx.try_recv().is_err());
}

/// A panicking step is caught, the job rejected, and the worker keeps serving.
#[test]
fn test_panicking_job_is_rejected() {
    let queue = Arc::new(WorkQueue::<Box<dyn Job>>::new());
    let pool = WorkerPool::new(queue, Some(1), Some("t-panic")).unwrap();
    let rejected = counting_handler(&pool);
    pool.prestart_all().unwrap();

    let (tx, rx) = unbounded();
    pool.execute(Box::new(Explosive));
    pool.execute(Box::new(GatedJob::plain(9, &tx)));

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().panicked, 1);
    pool.shutdown(true);
}

/// Shutdown may be called repeatedly.
#[test]
fn test_shutdown_is_idempotent() {
    let pool: WorkerPool<GatedJob> = WorkerPool::new(Arc::new(WorkQueue::new()), Some(3), None).unwrap();
    pool.prestart_all().unwrap();
    pool.shutdown(false);
    pool.shutdown(true);
    pool.shutdown(true);
    assert!(pool.is_shutdown());
    assert!(pool.queue().try_pop().is_none());
}

/// One sentinel per consumer stops exactly that many consumers.
#[test]
fn test_sentinels_stop_each_consumer_once() {
    let queue = Arc::new(WorkQueue::<u32>::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = 0;
                while let Dispatch::Run(_) = queue.pop() {
                    seen += 1;
                }
                seen
            })
        })
        .collect();

    for i in 0..100 {
        queue.push_back(i);
    }
    for _ in 0..4 {
        queue.push_stop();
    }
    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 100);
    assert!(queue.is_empty());
}
