//! Run a small batch of jobs against two scripted local backends.
//!
//! This example demonstrates how to wire an orchestrator with
//! fleet-testkit's `ScriptedBackend`, a `CreateJobStarter` building one
//! payload per row, and a CSV ledger that can be resumed by running the
//! example again with the same path.
//!
//! Usage: `cargo run --example local_backends -- [ledger.csv]`
//! Set `RUST_LOG=fleet=debug` for per-job tracing.

use std::sync::Arc;

use fleet::runtime::{CreateJobStarter, OrchestratorBuilder};
use fleet::*;
use fleet_testkit::ScriptedBackend;
use tracing_subscriber::EnvFilter;

fn tile_rows() -> Vec<ColumnMap> {
    (0..6)
        .map(|i| {
            let west = 5.0 + i as f64;
            let mut cells = ColumnMap::new();
            cells.insert("tile".into(), ColumnValue::Text(format!("tile-{i}")));
            cells.insert("year".into(), ColumnValue::Int(2021));
            cells.insert(
                "geometry".into(),
                ColumnValue::Geometry(ledger::wkt::Geometry::bbox(west, 51.0, west + 1.0, 52.0)),
            );
            cells
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ledger_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "local_backends.csv".to_string());

    let foo = ScriptedBackend::new("https://foo.local")
        .with_script(["queued", "running", "running", "finished"])
        .with_usage("cpu", 42.0, "cpu-seconds")
        .with_costs(1.5);
    let bar = ScriptedBackend::new("https://bar.local").with_script(["running", "error"]);

    let starter = CreateJobStarter::new(|record: &JobRecord, backend: &str| {
        let tile = record.column("tile")?.to_string();
        Some(serde_json::json!({
            "process": "ndvi_composite",
            "tile": tile,
            "geometry": record.column("geometry").map(ToString::to_string),
            "backend": backend,
        }))
    });

    let orchestrator = OrchestratorBuilder::new()
        .with_config(
            OrchestratorConfig::default()
                .with_poll_interval(200)
                .with_cancel_running_job_after(60_000),
        )
        .with_backend(BackendSpec::new("foo", foo.connection()).with_parallel_jobs(2))
        .with_backend(BackendSpec::new("bar", bar.connection()).with_parallel_jobs(1))
        .with_starter(Arc::new(starter))
        .build()?;

    println!("Ledger: {ledger_path}");
    let source = JobSource::new()
        .with_rows(tile_rows())
        .with_output_path(&ledger_path);
    let stats = orchestrator.run(source).await?;

    println!("\nRun statistics:\n{stats}");
    let ledger = open_ledger(&ledger_path, LedgerSchema::default())?;
    for record in ledger.records().await? {
        println!(
            "row {:>2}  {:<4} {:<8} {:<10} cpu={}",
            record.row.0,
            record.backend_name.as_deref().unwrap_or("-"),
            record.id.as_deref().unwrap_or("-"),
            record.status.as_str(),
            record.cpu.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
