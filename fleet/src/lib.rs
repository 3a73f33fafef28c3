//! Fleet - Multi-backend batch job orchestration.
//!
//! Runs a large, fixed set of independent jobs against one or more remote
//! execution backends, keeping the state of every job in a durable ledger so
//! an interrupted run can be resumed.
//!
//! # Core Concepts
//!
//! - **Ledger**: The [`JobLedger`] trait stores one [`JobRecord`] per job.
//!   File-backed ledgers ([`CsvLedger`], and Parquet/PostgreSQL behind
//!   feature flags) are the source of truth for resumption.
//!
//! - **Backends**: The [`BackendRegistry`] holds named backends, each with a
//!   [`BackendConnection`] wrapped in [`ResilientConnection`] retry handling
//!   and a [`BackendCapacity`] budget.
//!
//! - **Orchestrator**: The [`Orchestrator`] control loop polls in-flight jobs,
//!   launches new ones within each backend's capacity, and hands job start
//!   calls to a [`WorkerPool`].
//!
//! - **Stats**: Every run returns [`Stats`], a multiset of named counters.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job ledger via sqlx
//! - `parquet` - Parquet job ledger via arrow/parquet
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use fleet::*;
//!
//! let orchestrator = OrchestratorBuilder::new()
//!     .with_config(OrchestratorConfig::default().with_poll_interval(5_000))
//!     .with_backend(BackendSpec::new("foo", connection).with_parallel_jobs(2))
//!     .with_starter(Arc::new(CreateJobStarter::new(|record: &JobRecord, _: &str| {
//!         Some(serde_json::json!({ "year": record.column("year")?.to_string() }))
//!     })))
//!     .build()?;
//!
//! let source = JobSource::new().with_rows(rows).with_output_path("jobs.csv");
//! let stats = orchestrator.run(source).await?;
//! ```

/// Remote execution backends and their connections.
///
/// The `backend` module defines the [`BackendConnection`] and [`Connector`]
/// traits, the [`ResilientConnection`] retry wrapper and the
/// [`BackendRegistry`] of named backends.
pub mod backend;

/// Per-backend capacity accounting.
pub mod capacity;

/// Configuration structures for the control loop and retry policy.
///
/// The `config` module defines [`OrchestratorConfig`] and [`RetryConfig`].
pub mod config;

/// Error types for backends, ledgers and configuration.
pub mod error;

/// Transient-error guard for remote I/O.
pub mod guard;

/// Core job record definitions.
///
/// The `job` module defines:
/// - [`JobRecord`] - one row of the job ledger
/// - [`JobStatus`] - the job lifecycle states
/// - [`ColumnValue`] and [`ColumnMap`] - caller-defined columns
/// - [`JobPatch`] - partial row updates from worker tasks
pub mod job;

/// Durable job ledgers.
///
/// The `ledger` module provides the [`JobLedger`] trait, the
/// [`LedgerSchema`] column rules, [`JobSource`] resolution and the
/// in-memory, CSV, Parquet and PostgreSQL implementations.
pub mod ledger;

/// Control loop and worker management.
///
/// The `runtime` module provides:
/// - [`Orchestrator`] - main orchestrator type
/// - [`OrchestratorBuilder`] - builder for orchestrators
/// - [`JobStarter`] and [`CreateJobStarter`] - hooks creating remote jobs
/// - [`JobLifecycle`] - hooks for finished, failed and canceled jobs
/// - [`WorkerPool`] - pool executing job start calls
/// - [`ShutdownToken`] - graceful shutdown signaling
pub mod runtime;

/// Named run counters.
pub mod stats;

/// Tracing spans and telemetry events.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

pub use backend::*;
pub use capacity::*;
pub use config::*;
pub use error::*;
pub use guard::*;
pub use job::*;
pub use ledger::*;
pub use runtime::*;
pub use stats::*;
