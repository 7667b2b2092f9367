//! Grouped queue benchmark
//!
//! Benchmarks the producer/consumer hot path: offer into a group, poll the
//! next group chosen by the round-robin router. Also measures contention
//! with several producers offering while one consumer polls, and the cost of
//! pushing the polled items through the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use taskmesh_dispatch::work::handler_fn;
use taskmesh_dispatch::{
    BoundedWorkerPool, DispatchMetrics, GroupedQueue, WorkItem, WorkerPoolConfig,
};

fn items(count: usize, groups: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| WorkItem::new(format!("group-{}", i % groups), json!(i)))
        .collect()
}

/// Offer a batch then poll it back out, varying the number of groups
fn bench_offer_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_queue/offer_poll");
    let batch = 1_000;
    group.throughput(Throughput::Elements(batch as u64));

    for groups in [1, 10, 100] {
        group.bench_with_input(BenchmarkId::new("groups", groups), &groups, |b, &groups| {
            b.iter_custom(|iters| {
                let queue = GroupedQueue::new();
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let batch_items = items(batch, groups);
                    let start = Instant::now();
                    for item in batch_items {
                        queue.offer(item);
                    }
                    while let Some(item) = queue.poll() {
                        black_box(item);
                    }
                    total += start.elapsed();
                }
                total
            });
        });
    }

    group.finish();
}

/// Oldest-time lookup across many groups
fn bench_oldest_queue_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_queue/oldest_queue_time");

    for groups in [10, 100, 1_000] {
        let queue = GroupedQueue::new();
        for item in items(groups * 4, groups) {
            queue.offer(item);
        }
        group.bench_with_input(BenchmarkId::new("groups", groups), &queue, |b, queue| {
            b.iter(|| black_box(queue.oldest_queue_time()));
        });
    }

    group.finish();
}

/// Several producer threads offering while one thread polls
fn bench_concurrent_producers(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouped_queue/concurrent");
    let per_producer = 1_000;

    for producers in [2, 4, 8] {
        group.throughput(Throughput::Elements((producers * per_producer) as u64));
        group.bench_with_input(
            BenchmarkId::new("producers", producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let queue = Arc::new(GroupedQueue::new());
                    let total = producers * per_producer;
                    std::thread::scope(|scope| {
                        for p in 0..producers {
                            let queue = Arc::clone(&queue);
                            scope.spawn(move || {
                                for i in 0..per_producer {
                                    queue.offer(WorkItem::new(format!("group-{p}"), json!(i)));
                                }
                            });
                        }

                        let mut polled = 0;
                        while polled < total {
                            if queue.poll().is_some() {
                                polled += 1;
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

/// Poll a filled queue into a worker pool and wait for every item to run
fn bench_drain_into_pool(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("grouped_queue/drain_into_pool");
    let batch = 1_000;
    group.throughput(Throughput::Elements(batch as u64));

    for workers in [1, 4, 16] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let queue = GroupedQueue::new();
                    for item in items(batch, 10) {
                        queue.offer(item);
                    }

                    let done = Arc::new(AtomicU64::new(0));
                    let handler = handler_fn({
                        let done = Arc::clone(&done);
                        move |_item| {
                            let done = Arc::clone(&done);
                            async move {
                                done.fetch_add(1, Ordering::Relaxed);
                                Ok(json!(null))
                            }
                        }
                    });
                    let pool = BoundedWorkerPool::new(
                        WorkerPoolConfig::sized(workers)
                            .with_min_workers(workers)
                            .with_queue_capacity(batch),
                        handler,
                        Arc::new(DispatchMetrics::new()),
                    )
                    .unwrap();

                    let start = Instant::now();
                    while let Some(item) = queue.poll() {
                        pool.submit(item).await.unwrap();
                    }
                    pool.shutdown();
                    pool.await_termination(Duration::from_secs(30)).await.unwrap();
                    total += start.elapsed();

                    assert_eq!(done.load(Ordering::Relaxed), batch as u64);
                }
                total
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_offer_poll,
    bench_oldest_queue_time,
    bench_concurrent_producers,
    bench_drain_into_pool
);
criterion_main!(benches);
