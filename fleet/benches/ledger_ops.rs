//! Benchmarks for job ledger operations using criterion.
//!
//! These benchmarks measure the operations the control loop issues on every
//! iteration:
//! - Bulk persist (upsert) of launched rows
//! - Status queries with a row limit
//! - CSV ledger persist, which rewrites the whole file

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fleet::*;
use fleet_testkit::rows;
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn seeded_ledger(rt: &Runtime, size: usize) -> Arc<dyn JobLedger> {
    let schema = LedgerSchema::default();
    let records = schema.normalize(rows(size)).expect("rows should normalize");
    let ledger: Arc<dyn JobLedger> = Arc::new(InMemoryLedger::new(schema));
    rt.block_on(ledger.initialize(records, OnExists::Error))
        .expect("initialize should succeed");
    ledger
}

fn launched(rows: std::ops::Range<usize>) -> Vec<JobRecord> {
    rows.map(|row| {
        let mut record = JobRecord::new(row)
            .with_status(JobStatus::QueuedForStart)
            .with_backend("foo");
        record.id = Some(format!("job-{row}"));
        record
    })
    .collect()
}

/// Benchmark: persist a batch of launched rows into an in-memory ledger.
fn bench_persist(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("persist");
    for batch_size in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            &batch_size,
            |b, &batch_size| {
                let ledger = seeded_ledger(&rt, 10_000);
                let batch = launched(0..batch_size);
                b.to_async(&rt).iter(|| async {
                    ledger.persist(&batch).await.expect("persist should succeed");
                });
            },
        );
    }
    group.finish();
}

/// Benchmark: fetch launch candidates from a large ledger.
fn bench_get_by_status(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("get_by_status");
    for size in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("not_started", size), &size, |b, &size| {
            let ledger = seeded_ledger(&rt, size);
            rt.block_on(ledger.persist(&launched(0..size / 2)))
                .expect("persist should succeed");
            b.to_async(&rt).iter(|| async {
                ledger
                    .get_by_status(&[JobStatus::NotStarted], Some(10))
                    .await
                    .expect("query should succeed")
            });
        });
    }
    group.finish();
}

/// Benchmark: persist into a CSV ledger.
fn bench_csv_persist(c: &mut Criterion) {
    let rt = create_runtime();
    let dir = tempfile::tempdir().expect("tempdir");

    let mut group = c.benchmark_group("csv_persist");
    group.sample_size(20);
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("rows", size), &size, |b, &size| {
            let path = dir.path().join(format!("jobs-{size}.csv"));
            let ledger = rt
                .block_on(create_ledger(&path, rows(size), LedgerSchema::default(), OnExists::Error))
                .expect("create should succeed");
            let batch = launched(0..10);
            b.to_async(&rt).iter(|| async {
                ledger.persist(&batch).await.expect("persist should succeed");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_persist, bench_get_by_status, bench_csv_persist);
criterion_main!(benches);
