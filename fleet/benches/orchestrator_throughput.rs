//! Benchmarks for orchestrator throughput using criterion.
//!
//! These benchmarks drive a full run over an in-memory ledger against
//! scripted backends that finish every job on the first poll, so the
//! numbers reflect control loop and worker pool overhead only:
//! - Rows per second with 1 backend
//! - Rows per second with 4 backends

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fleet::runtime::OrchestratorBuilder;
use fleet::*;
use fleet_testkit::{fast_config, rows, ScriptedBackend, ScriptedStarter};
use tokio::runtime::Runtime;

const ROWS: usize = 200;

fn bench_run_to_completion(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("run_to_completion");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ROWS as u64));

    for backend_count in [1usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("backends", backend_count),
            &backend_count,
            |b, &backend_count| {
                b.to_async(&rt).iter(|| async move {
                    let mut builder = OrchestratorBuilder::new()
                        .with_config(fast_config().with_poll_interval(1).with_worker_count(4))
                        .with_starter(Arc::new(ScriptedStarter::new()));
                    for i in 0..backend_count {
                        let backend = ScriptedBackend::new(format!("https://b{i}.example"));
                        builder = builder.with_backend(
                            BackendSpec::new(format!("b{i}"), backend.connection())
                                .with_parallel_jobs(20)
                                .with_queueing_limit(20),
                        );
                    }
                    let orchestrator = builder.build().expect("build should succeed");
                    orchestrator
                        .run(JobSource::new().with_rows(rows(ROWS)))
                        .await
                        .expect("run should succeed")
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_run_to_completion);
criterion_main!(benches);
