//! Prometheus metrics instrumentation for fleet.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `fleet_jobs_launched_total` - Jobs handed to a backend
//! - `fleet_status_transitions_total` - Observed job status changes
//! - `fleet_worker_results_dropped_total` - Worker results that were discarded
//!
//! ## Gauges
//! - `fleet_active_jobs` - Jobs occupying a backend's run capacity
//!
//! ## Histograms
//! - `fleet_start_task_duration_seconds` - Duration of job start calls
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for fleet metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs launched.
///
/// Labels:
/// - `backend`: The backend name
pub static JOBS_LAUNCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("fleet_jobs_launched_total", "Total number of jobs launched");
    CounterVec::new(opts, &["backend"]).expect("fleet_jobs_launched_total metric creation failed")
});

/// Counter for observed status transitions.
///
/// Labels:
/// - `backend`: The backend name
/// - `status`: The status the job moved into
pub static STATUS_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "fleet_status_transitions_total",
        "Total number of job status transitions",
    );
    CounterVec::new(opts, &["backend", "status"])
        .expect("fleet_status_transitions_total metric creation failed")
});

/// Counter for discarded worker results.
///
/// Labels:
/// - `reason`: Why the result was dropped (unknown_row, panicked)
pub static WORKER_RESULTS_DROPPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "fleet_worker_results_dropped_total",
        "Total number of discarded worker results",
    );
    CounterVec::new(opts, &["reason"])
        .expect("fleet_worker_results_dropped_total metric creation failed")
});

/// Gauge for jobs in a capacity-occupying state.
///
/// Labels:
/// - `backend`: The backend name
pub static ACTIVE_JOBS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("fleet_active_jobs", "Jobs currently occupying backend capacity");
    GaugeVec::new(opts, &["backend"]).expect("fleet_active_jobs metric creation failed")
});

/// Histogram for job start call duration in seconds.
///
/// Labels:
/// - `outcome`: success or failure
pub static START_TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "fleet_start_task_duration_seconds",
        "Job start call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("fleet_start_task_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_LAUNCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(STATUS_TRANSITIONS_TOTAL.clone()),
        Box::new(WORKER_RESULTS_DROPPED_TOTAL.clone()),
        Box::new(ACTIVE_JOBS.clone()),
        Box::new(START_TASK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_launched(backend: &str) {
    JOBS_LAUNCHED_TOTAL.with_label_values(&[backend]).inc();
}

pub fn record_status_transition(backend: &str, status: &str) {
    STATUS_TRANSITIONS_TOTAL
        .with_label_values(&[backend, status])
        .inc();
}

pub fn record_worker_result_dropped(reason: &str) {
    WORKER_RESULTS_DROPPED_TOTAL
        .with_label_values(&[reason])
        .inc();
}

pub fn set_active_jobs(backend: &str, active: f64) {
    ACTIVE_JOBS.with_label_values(&[backend]).set(active);
}

pub fn observe_start_task_duration(outcome: &str, duration_secs: f64) {
    START_TASK_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_launched("foo");
        record_status_transition("foo", "running");
        record_worker_result_dropped("unknown_row");
        set_active_jobs("foo", 2.0);
        observe_start_task_duration("success", 0.25);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("fleet_jobs_launched_total"));
        assert!(output.contains("fleet_status_transitions_total"));
        assert!(output.contains("fleet_active_jobs"));
    }
}
