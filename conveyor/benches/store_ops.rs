//! Benchmarks for the in-process job store.
//!
//! - single insert
//! - claim then complete with retention pruning
//! - batch drain through the full lifecycle

#![allow(missing_docs)]

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conveyor::{BackoffPolicy, JobRecord, JobStore, MemoryJobStore, QueueName, RetentionPolicy};
use conveyor_testkit::payloads;
use tokio::runtime::Runtime;

const NO_WAIT: Duration = Duration::from_millis(0);

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn record() -> JobRecord {
    JobRecord::new(
        QueueName::Analytics,
        "rollup",
        payloads::analytics("acme", 1),
        3,
        BackoffPolicy::exponential(1_000),
    )
}

fn bench_insert(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("insert");
    group.sample_size(100);

    group.bench_function("memory", |b| {
        let store = MemoryJobStore::new();
        b.to_async(&rt).iter(|| async {
            store.insert(record()).await.expect("insert should succeed");
        });
    });

    group.finish();
}

/// One claim/complete cycle against a store already holding completed history,
/// so every completion also prunes.
fn bench_claim_complete(c: &mut Criterion) {
    let rt = create_runtime();
    let retention = RetentionPolicy {
        keep_completed: 100,
        ..RetentionPolicy::default()
    };

    let mut group = c.benchmark_group("claim_complete");
    group.sample_size(100);

    group.bench_function("memory", |b| {
        let store = MemoryJobStore::new();
        b.to_async(&rt).iter(|| async {
            store.insert(record()).await.expect("insert should succeed");
            let lease = store
                .claim(QueueName::Analytics, "bench-w0", NO_WAIT)
                .await
                .expect("claim should succeed")
                .expect("job should be waiting");
            store
                .complete(&lease, serde_json::Value::Null, &retention)
                .await
                .expect("complete should succeed");
        });
    });

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let rt = create_runtime();
    let retention = RetentionPolicy::default();

    let mut group = c.benchmark_group("drain");
    group.sample_size(30);

    for size in [10_u64, 100, 500] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("memory", size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async {
                let store = MemoryJobStore::new();
                for _ in 0..size {
                    store.insert(record()).await.expect("insert should succeed");
                }
                while let Some(lease) = store
                    .claim(QueueName::Analytics, "bench-w0", NO_WAIT)
                    .await
                    .expect("claim should succeed")
                {
                    store
                        .complete(&lease, serde_json::Value::Null, &retention)
                        .await
                        .expect("complete should succeed");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_claim_complete, bench_drain);
criterion_main!(benches);
