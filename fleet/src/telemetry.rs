//! Tracing and telemetry instrumentation for fleet.
//!
//! Span helpers for the control loop and the worker pool, plus event helpers
//! that log through `tracing` and, with the `metrics` feature, update the
//! Prometheus metrics in [`crate::metrics`]. All functions work with and
//! without the feature.

use std::future::Future;
use std::time::Instant;

use tracing::{info_span, Instrument, Span};

use crate::job::{JobStatus, RowIndex};

/// Span covering one iteration of the control loop.
#[must_use]
pub fn poll_span(run_id: impl AsRef<str>, iteration: u64) -> Span {
    info_span!("fleet.poll", run_id = %run_id.as_ref(), iteration = iteration)
}

/// Span covering the launch of one ledger row on a backend.
#[must_use]
pub fn launch_span(backend: impl AsRef<str>, row: RowIndex) -> Span {
    info_span!("fleet.launch", backend = %backend.as_ref(), row = %row)
}

/// Span covering one worker task.
#[must_use]
pub fn task_span(job_id: impl AsRef<str>, row: RowIndex) -> Span {
    info_span!("fleet.task", job_id = %job_id.as_ref(), row = %row)
}

/// Attach a [`task_span`] to a future.
pub fn instrument_task<F>(
    job_id: impl AsRef<str>,
    row: RowIndex,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(task_span(job_id, row))
}

/// Record a status change observed by the control loop.
pub fn record_status_transition(
    backend: impl AsRef<str>,
    row: RowIndex,
    job_id: Option<&str>,
    from: JobStatus,
    to: JobStatus,
) {
    tracing::info!(
        backend = %backend.as_ref(),
        row = %row,
        job_id = job_id.unwrap_or(""),
        from = %from,
        to = %to,
        "job status changed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_status_transition(backend.as_ref(), to.as_str());
}

/// Record a job handed to a backend.
pub fn record_job_launched(backend: impl AsRef<str>, row: RowIndex, job_id: &str) {
    tracing::info!(backend = %backend.as_ref(), row = %row, job_id, "job launched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_launched(backend.as_ref());
}

/// Record a worker result that could not be applied.
pub fn record_worker_result_dropped(reason: &str, row: Option<RowIndex>) {
    tracing::warn!(reason, row = ?row, "dropping worker result");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_result_dropped(reason);
}

/// Update the per-backend active job gauge.
pub fn set_active_jobs(backend: impl AsRef<str>, active: usize) {
    tracing::debug!(backend = %backend.as_ref(), active, "active jobs updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_jobs(backend.as_ref(), active as f64);
}

/// Start timing a worker task.
pub fn record_task_start() -> TaskTimingHandle {
    TaskTimingHandle {
        start: Instant::now(),
    }
}

/// Finish timing a worker task.
pub fn record_task_end(handle: TaskTimingHandle, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::debug!(outcome, duration_secs, "start task finished");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_start_task_duration(outcome, duration_secs);
}

/// Handle for tracking worker task duration.
#[derive(Debug)]
pub struct TaskTimingHandle {
    start: Instant,
}

impl TaskTimingHandle {
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
