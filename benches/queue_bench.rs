//! Benchmarks for the detection scheduler.
//!
//! Benchmarks cover:
//! - Work queue push/pop
//! - Delay-set promotion
//! - Worker pool throughput for multi-step jobs
//! - End-to-end submission against the in-memory remote service

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use rand::Rng;
use detect_lot::core::{Dispatch, Fingerprint, Job, Step, WorkQueue, WorkerPool};
use detect_lot::remote::{Credentials, MockConnector, MockRemote};
use detect_lot::{Detector, DetectorConfig, WaitStatus};

// ============================================================================
// Test Jobs
// ============================================================================

/// Job that requeues itself `remaining` times before reporting.
struct Bounce {
    remaining: u32,
    done: Sender<()>,
}

impl Job for Bounce {
    fn step(&mut self) -> Step {
        if self.remaining == 0 {
            let _ = self.done.send(());
            return Step::Finished;
        }
        self.remaining -= 1;
        Step::Requeue
    }
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");

    for size in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let q = WorkQueue::new();
                for i in 0..size {
                    if i % 2 == 0 {
                        q.push_back(i);
                    } else {
                        q.push_front(i);
                    }
                }
                while let Some(Dispatch::Run(item)) = q.try_pop() {
                    black_box(item);
                }
            });
        });
    }
    group.finish();
}

fn bench_queue_delay_promotion(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_delay_promotion");

    for size in [100u64, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut rng = rand::rng();
            let delays: Vec<Duration> = (0..size)
                .map(|_| Duration::from_nanos(rng.random_range(1..2_000)))
                .collect();
            b.iter(|| {
                let q = WorkQueue::new();
                for (i, delay) in delays.iter().enumerate() {
                    q.push_after(i, *delay);
                }
                std::thread::sleep(Duration::from_micros(5));
                let mut count = 0;
                while count < delays.len() {
                    if let Dispatch::Run(item) = q.pop() {
                        black_box(item);
                        count += 1;
                    }
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Pool Benchmarks
// ============================================================================

fn bench_pool_requeue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_requeue_throughput");
    group.sample_size(20);

    for workers in [1usize, 4, 16] {
        let pool = WorkerPool::new(Arc::new(WorkQueue::new()), Some(workers), None).unwrap();
        pool.prestart_all().unwrap();
        let jobs = 1_000u64;
        group.throughput(Throughput::Elements(jobs * 4));

        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let (tx, rx) = unbounded();
                for _ in 0..jobs {
                    pool.execute(Bounce {
                        remaining: 3,
                        done: tx.clone(),
                    });
                }
                for _ in 0..jobs {
                    rx.recv().unwrap();
                }
            });
        });
        pool.shutdown(true);
    }
    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_detector_end_to_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("detector_end_to_end");
    group.sample_size(10);

    let fingerprints: Vec<Fingerprint> = (0..500)
        .map(|i| Fingerprint::of_bytes(format!("bench-{i}").as_bytes()))
        .collect();
    group.throughput(Throughput::Elements(fingerprints.len() as u64));

    group.bench_function("mock_remote_500", |b| {
        b.iter(|| {
            let detector = Detector::new(
                DetectorConfig::new()
                    .with_pool_size(16)
                    .with_max_queued_tasks(1_000)
                    .with_min_poll_interval_ms(0),
                MockConnector::new(Arc::new(MockRemote::new().with_detect_polls(1))),
            );
            detector.init(&Credentials::new("bench", "bench"), None).unwrap();
            for fp in &fingerprints {
                let _ = detector.detect_url("https://bench.example.com/s", fp.as_str(), -1, |r| {
                    black_box(r);
                });
            }
            assert_eq!(detector.wait_until_empty(-1), WaitStatus::Ready);
            detector.uninit();
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_queue_delay_promotion,
    bench_pool_requeue_throughput,
    bench_detector_end_to_end,
);
criterion_main!(benches);
