use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::{
    Backend, BackendConnection, BackendRegistry, BackendSpec, JobDescription, RemoteJob,
};
use crate::capacity::load_by_backend;
use crate::config::OrchestratorConfig;
use crate::error::{BackendError, ConfigError};
use crate::guard::ignore_connection_errors;
use crate::job::{JobRecord, JobStatus, RowIndex};
use crate::ledger::{JobLedger, JobSource};
use crate::stats::{keys, Stats};
use crate::telemetry;

use super::lifecycle::JobLifecycle;
use super::worker::{StartJobTask, WorkerPool};

/// Caller hook that creates the remote job for a ledger row.
///
/// Returning `Ok(None)` skips the row. Connection and API errors mark the
/// row `start_failed`; exhausted retries abort the run.
#[async_trait]
pub trait JobStarter: Send + Sync {
    async fn start_job(
        &self,
        record: &JobRecord,
        backend: &str,
        connection: Arc<dyn BackendConnection>,
    ) -> Result<Option<RemoteJob>, BackendError>;
}

/// [`JobStarter`] that builds a job payload from the row and creates it.
///
/// The payload builder returns `None` for rows that should be skipped.
pub struct CreateJobStarter<F> {
    build_payload: F,
}

impl<F> CreateJobStarter<F>
where
    F: Fn(&JobRecord, &str) -> Option<serde_json::Value> + Send + Sync,
{
    pub fn new(build_payload: F) -> Self {
        Self { build_payload }
    }
}

#[async_trait]
impl<F> JobStarter for CreateJobStarter<F>
where
    F: Fn(&JobRecord, &str) -> Option<serde_json::Value> + Send + Sync,
{
    async fn start_job(
        &self,
        record: &JobRecord,
        backend: &str,
        connection: Arc<dyn BackendConnection>,
    ) -> Result<Option<RemoteJob>, BackendError> {
        let Some(payload) = (self.build_payload)(record, backend) else {
            return Ok(None);
        };
        connection.create_job(&payload).await.map(Some)
    }
}

/// Token for signaling graceful shutdown to the background control loop.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

struct Background {
    token: ShutdownToken,
    handle: JoinHandle<anyhow::Result<Stats>>,
}

/// Multi-backend job orchestrator.
///
/// Drives every row of a job ledger through
/// `not_started → queued_for_start → queued → running → finished|error|canceled`
/// while keeping each backend within its `parallel_jobs` and
/// `queueing_limit` budget. [`run`](Self::run) blocks until every row is
/// terminal; [`start`](Self::start) and [`stop`](Self::stop) run the same
/// loop in the background.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backends: Arc<BackendRegistry>,
    starter: Arc<dyn JobStarter>,
    lifecycle: Arc<dyn JobLifecycle>,
    background: parking_lot::Mutex<Option<Background>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("backends", &self.backends.names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Orchestrator {
    pub(crate) fn new(
        config: OrchestratorConfig,
        backends: BackendRegistry,
        starter: Arc<dyn JobStarter>,
        lifecycle: Arc<dyn JobLifecycle>,
    ) -> Self {
        Self {
            config,
            backends: Arc::new(backends),
            starter,
            lifecycle,
            background: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Register another backend.
    pub fn add_backend(&self, spec: BackendSpec) -> Result<(), ConfigError> {
        self.backends.add_backend(spec)
    }

    /// Validate configuration, resolve the ledger and set up a run.
    pub async fn prepare(&self, source: impl Into<JobSource>) -> anyhow::Result<JobRun> {
        self.backends.ensure_not_empty()?;
        let ledger = source.into().resolve().await?;
        Ok(JobRun {
            run_id: Uuid::now_v7().to_string(),
            config: self.config.clone(),
            backends: Arc::clone(&self.backends),
            starter: Arc::clone(&self.starter),
            lifecycle: Arc::clone(&self.lifecycle),
            ledger,
            pool: WorkerPool::new(self.config.worker_count),
            stats: Stats::new(),
            cancel_requested: HashSet::new(),
            starting: HashSet::new(),
            iteration: 0,
        })
    }

    /// Run until every job in the ledger reaches a terminal state.
    pub async fn run(&self, source: impl Into<JobSource>) -> anyhow::Result<Stats> {
        self.prepare(source).await?.run_to_completion(None).await
    }

    /// Start the control loop in the background.
    pub async fn start(&self, source: impl Into<JobSource>) -> anyhow::Result<()> {
        if self.is_running() {
            anyhow::bail!("orchestrator is already running");
        }
        let run = self.prepare(source).await?;
        let token = ShutdownToken::new();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { run.run_to_completion(Some(loop_token)).await });

        let mut background = self.background.lock();
        if background.is_some() {
            token.cancel();
            anyhow::bail!("orchestrator is already running");
        }
        *background = Some(Background { token, handle });
        tracing::info!("orchestrator started in background");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.background
            .lock()
            .as_ref()
            .is_some_and(|b| !b.handle.is_finished())
    }

    /// Request the background loop to stop and wait for it.
    ///
    /// Waits at most the configured stop timeout; when that elapses the
    /// loop is left to finish on its own and `Ok(None)` is returned. Errors
    /// that ended the loop are returned.
    pub async fn stop(&self) -> anyhow::Result<Option<Stats>> {
        let background = self.background.lock().take();
        let Some(background) = background else {
            tracing::warn!("stop called but orchestrator is not running");
            return Ok(None);
        };

        tracing::info!("initiating graceful shutdown of orchestrator");
        background.token.cancel();

        let timeout = self.config.stop_timeout();
        match tokio::time::timeout(timeout, background.handle).await {
            Ok(Ok(Ok(stats))) => {
                tracing::info!("orchestrator shutdown complete");
                Ok(Some(stats))
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(err)) => {
                tracing::warn!("control loop task failed: {err:?}");
                Ok(None)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "control loop did not stop in time"
                );
                Ok(None)
            }
        }
    }
}

/// State of one orchestration run over one ledger.
///
/// Owned by the control loop; the ledger is only written from here.
pub struct JobRun {
    run_id: String,
    config: OrchestratorConfig,
    backends: Arc<BackendRegistry>,
    starter: Arc<dyn JobStarter>,
    lifecycle: Arc<dyn JobLifecycle>,
    ledger: Arc<dyn JobLedger>,
    pool: WorkerPool,
    stats: Stats,
    cancel_requested: HashSet<RowIndex>,
    /// Rows whose start task was submitted and not drained yet.
    starting: HashSet<RowIndex>,
    iteration: u64,
}

impl fmt::Debug for JobRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRun")
            .field("run_id", &self.run_id)
            .field("ledger", &self.ledger.location())
            .field("iteration", &self.iteration)
            .field("starting", &self.starting.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl JobRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Start tasks submitted but not yet drained.
    pub fn pending_tasks(&self) -> usize {
        self.pool.pending()
    }

    /// Drive the loop until all rows are terminal or `shutdown` fires, then
    /// shut down the worker pool and fold in its last results.
    pub async fn run_to_completion(mut self, shutdown: Option<ShutdownToken>) -> anyhow::Result<Stats> {
        tracing::info!(run_id = %self.run_id, ledger = %self.ledger.location(), "orchestration run started");
        let outcome = self.run_loop(shutdown.as_ref()).await;
        let finished = self.finish().await;
        outcome?;
        let stats = finished?;
        tracing::info!(run_id = %self.run_id, %stats, "orchestration run finished");
        Ok(stats)
    }

    async fn run_loop(&mut self, shutdown: Option<&ShutdownToken>) -> anyhow::Result<()> {
        let interval = self.config.poll_interval();
        loop {
            if shutdown.is_some_and(ShutdownToken::is_cancelled) {
                tracing::info!(run_id = %self.run_id, "control loop shutting down");
                return Ok(());
            }
            if !self.step().await? {
                return Ok(());
            }

            self.stats.incr(keys::SLEEP);
            match shutdown {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::info!(run_id = %self.run_id, "control loop shutting down");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => tokio::time::sleep(interval).await,
            }
        }
    }

    /// One iteration: poll in-flight jobs, launch new ones within capacity,
    /// fold in finished start tasks.
    ///
    /// Returns whether any row is still non-terminal.
    pub async fn step(&mut self) -> anyhow::Result<bool> {
        self.iteration += 1;
        self.stats.incr(keys::RUN_LOOP);
        let span = telemetry::poll_span(&self.run_id, self.iteration);

        async {
            self.track_statuses().await?;
            self.launch_jobs().await?;
            self.collect_results(Duration::ZERO).await?;
            let counts = self.ledger.count_by_status(&JobStatus::NON_TERMINAL).await?;
            Ok::<_, anyhow::Error>(counts.values().sum::<usize>() > 0)
        }
        .instrument(span)
        .await
    }

    async fn finish(&mut self) -> anyhow::Result<Stats> {
        self.pool.shutdown().await;
        self.collect_results(Duration::ZERO).await?;
        Ok(self.stats.clone())
    }

    async fn persist(&mut self, records: &[JobRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.ledger.persist(records).await?;
        self.stats.incr(keys::JOB_DB_PERSIST);
        Ok(())
    }

    async fn track_statuses(&mut self) -> anyhow::Result<()> {
        self.stats.incr(keys::TRACK_STATUSES);
        let active = self.ledger.get_by_status(&JobStatus::ACTIVE, None).await?;
        let mut updated = Vec::with_capacity(active.len());

        for record in active {
            if let Some(record) = self.track_job(record).await? {
                updated.push(record);
            }
        }
        self.persist(&updated).await
    }

    /// Poll one in-flight job. `None` leaves the row untouched.
    async fn track_job(&mut self, mut record: JobRecord) -> anyhow::Result<Option<JobRecord>> {
        let (Some(job_id), Some(backend_name)) = (record.id.clone(), record.backend_name.clone())
        else {
            tracing::warn!(row = %record.row, status = %record.status, "in-flight job without id or backend, skipping");
            return Ok(None);
        };
        let connection = match self.backends.connection(&backend_name) {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(row = %record.row, backend = %backend_name, error = %err, "cannot poll job");
                return Ok(None);
            }
        };

        self.stats.incr(keys::JOB_DESCRIBE);
        let described = ignore_connection_errors(
            "describe_job",
            self.config.connection_error_backoff(),
            connection.describe_job(&job_id),
        )
        .await;
        let description = match described {
            Ok(Some(description)) => description,
            Ok(None) => return Ok(None),
            Err(err) if err.is_retries_exhausted() => return Err(err.into()),
            Err(err) => {
                self.stats.incr(keys::JOB_DESCRIBE_ERROR);
                tracing::warn!(row = %record.row, job_id = %job_id, error = %err, "failed to describe job");
                return Ok(None);
            }
        };
        let reported = match JobStatus::from_backend(&description.status) {
            Ok(status) => status,
            Err(err) => {
                self.stats.incr(keys::JOB_DESCRIBE_ERROR);
                tracing::warn!(row = %record.row, job_id = %job_id, error = %err, "ignoring status report");
                return Ok(None);
            }
        };

        let previous = record.status;
        let status = match (previous, reported) {
            (JobStatus::QueuedForStart, JobStatus::Created) => JobStatus::QueuedForStart,
            (_, reported) => reported,
        };
        apply_usage(&mut record, &description);

        if status == JobStatus::Running {
            if previous != JobStatus::Running {
                self.stats.incr(keys::JOB_STARTED_RUNNING);
                record.running_start_time = Some(Utc::now());
            } else if record.running_start_time.is_none() {
                tracing::warn!(row = %record.row, job_id = %job_id, "running job has no running_start_time, stamping now");
                record.running_start_time = Some(Utc::now());
            }
        }
        record.status = status;

        let awaiting_start = matches!(previous, JobStatus::QueuedForStart | JobStatus::Created);
        if awaiting_start && reported == JobStatus::Created && !self.starting.contains(&record.row) {
            // No start task for this row is in flight in this run.
            match self.backends.get(&backend_name) {
                Some(backend) => {
                    tracing::info!(row = %record.row, job_id = %job_id, "created job has no start task, resubmitting");
                    self.stats.incr(keys::JOB_START_RESUBMITTED);
                    self.queue_start(&backend, &mut record, &job_id, &connection).await;
                }
                None => {
                    tracing::warn!(row = %record.row, backend = %backend_name, "backend of created job is not registered");
                }
            }
        }
        let status = record.status;

        if status != previous {
            telemetry::record_status_transition(&backend_name, record.row, Some(&job_id), previous, status);
            self.fire_lifecycle(&record, status, &connection).await;
        }
        if status == JobStatus::Running {
            self.cancel_if_overdue(&record, &job_id, &connection).await;
        }
        Ok(Some(record))
    }

    async fn fire_lifecycle(
        &mut self,
        record: &JobRecord,
        status: JobStatus,
        connection: &Arc<dyn BackendConnection>,
    ) {
        let connection = Arc::clone(connection);
        let outcome = match status {
            JobStatus::Finished => {
                self.stats.incr(keys::JOB_FINISHED);
                self.lifecycle.on_job_done(record, connection).await
            }
            JobStatus::Error => {
                self.stats.incr(keys::JOB_FAILED);
                self.lifecycle.on_job_error(record, connection).await
            }
            JobStatus::Canceled => {
                self.stats.incr(keys::JOB_CANCELED);
                self.lifecycle.on_job_cancel(record, connection).await
            }
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            self.stats.incr(keys::CALLBACK_ERROR);
            tracing::error!(row = %record.row, status = %status, error = %err, "lifecycle callback failed");
        }
    }

    async fn cancel_if_overdue(
        &mut self,
        record: &JobRecord,
        job_id: &str,
        connection: &Arc<dyn BackendConnection>,
    ) {
        let (Some(limit), Some(running_since)) = (
            self.config.cancel_running_job_after(),
            record.running_start_time,
        ) else {
            return;
        };
        let elapsed = (Utc::now() - running_since).to_std().unwrap_or_default();
        if elapsed <= limit || !self.cancel_requested.insert(record.row) {
            return;
        }

        tracing::info!(
            row = %record.row,
            job_id,
            elapsed_secs = elapsed.as_secs(),
            limit_secs = limit.as_secs(),
            "running too long, stopping job"
        );
        self.stats.incr(keys::JOB_CANCEL);
        if let Err(err) = connection.stop_job(job_id).await {
            self.stats.incr(keys::JOB_CANCEL_FAILED);
            tracing::warn!(row = %record.row, job_id, error = %err, "failed to stop job");
        }
    }

    async fn launch_jobs(&mut self) -> anyhow::Result<()> {
        let active = self.ledger.get_by_status(&JobStatus::ACTIVE, None).await?;
        let loads = load_by_backend(&active);

        for backend in self.backends.backends() {
            let load = loads.get(backend.name()).copied().unwrap_or_default();
            telemetry::set_active_jobs(backend.name(), load.active);
            let slots = backend.capacity().free_slots(load);
            if slots == 0 {
                continue;
            }

            let candidates = self
                .ledger
                .get_by_status(&[JobStatus::NotStarted], Some(slots))
                .await?;
            if candidates.is_empty() {
                break;
            }
            tracing::debug!(backend = %backend.name(), slots, launching = candidates.len(), "launching jobs");

            let mut launched = Vec::with_capacity(candidates.len());
            for record in candidates {
                let span = telemetry::launch_span(backend.name(), record.row);
                let record = self.launch_job(&backend, record).instrument(span).await?;
                launched.push(record);
            }
            self.persist(&launched).await?;
        }
        Ok(())
    }

    async fn launch_job(&mut self, backend: &Backend, mut record: JobRecord) -> anyhow::Result<JobRecord> {
        record.backend_name = Some(backend.name().to_string());
        record.start_time = Some(Utc::now());
        self.stats.incr(keys::START_JOB_CALL);

        let connection = match backend.connection() {
            Ok(connection) => connection,
            Err(err) => return self.start_failed(record, err),
        };
        let job = match self.starter.start_job(&record, backend.name(), Arc::clone(&connection)).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.stats.incr(keys::START_JOB_SKIPPED);
                tracing::info!(row = %record.row, "start_job returned no job, skipping row");
                record.status = JobStatus::Skipped;
                return Ok(record);
            }
            Err(err) => return self.start_failed(record, err),
        };

        if !record.assign_remote_id(job.job_id.clone()) {
            tracing::warn!(row = %record.row, job_id = %job.job_id, existing = ?record.id, "row already carries another job id");
        }
        telemetry::record_job_launched(backend.name(), record.row, &job.job_id);

        self.stats.incr(keys::JOB_GET_STATUS);
        let queried = ignore_connection_errors(
            "job_status",
            self.config.connection_error_backoff(),
            connection.job_status(&job.job_id),
        )
        .await;
        record.status = match queried {
            Ok(Some(status)) => JobStatus::from_backend(&status).unwrap_or_else(|err| {
                tracing::warn!(row = %record.row, error = %err, "unexpected status after create, assuming created");
                JobStatus::Created
            }),
            Ok(None) => JobStatus::Created,
            Err(err) if err.is_retries_exhausted() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(row = %record.row, error = %err, "status query after create failed, assuming created");
                JobStatus::Created
            }
        };

        if record.status == JobStatus::Created {
            self.queue_start(backend, &mut record, &job.job_id, &connection).await;
        }
        Ok(record)
    }

    /// Hand the start call of a created job to the worker pool.
    async fn queue_start(
        &mut self,
        backend: &Backend,
        record: &mut JobRecord,
        job_id: &str,
        connection: &Arc<dyn BackendConnection>,
    ) {
        self.refresh_token(backend, connection).await;
        let task = StartJobTask::new(
            job_id,
            record.row,
            connection.root_url(),
            connection.access_token(),
            connection.connector(),
        );
        match self.pool.submit(Box::new(task)) {
            Ok(()) => {
                self.starting.insert(record.row);
                self.stats.incr(keys::JOB_QUEUED_FOR_START);
                record.status = JobStatus::QueuedForStart;
            }
            Err(err) => {
                self.stats.incr(keys::JOB_QUEUED_FOR_START_FAILED);
                tracing::error!(row = %record.row, job_id, error = %err, "could not queue job start");
                record.status = JobStatus::QueuedForStartFailed;
            }
        }
    }

    fn start_failed(&mut self, mut record: JobRecord, err: BackendError) -> anyhow::Result<JobRecord> {
        if err.is_retries_exhausted() {
            return Err(err.into());
        }
        self.stats.incr(keys::START_JOB_ERROR);
        tracing::warn!(row = %record.row, backend = ?record.backend_name, error = %err, "failed to start job");
        record.status = JobStatus::StartFailed;
        Ok(record)
    }

    async fn refresh_token(&mut self, backend: &Backend, connection: &Arc<dyn BackendConnection>) {
        if !backend.claim_token_refresh(self.config.token_refresh_interval()) {
            return;
        }
        self.stats.incr(keys::TOKEN_REFRESH);
        if let Err(err) = connection.refresh_access_token().await {
            tracing::warn!(backend = %backend.name(), error = %err, "access token refresh failed");
        }
    }

    async fn collect_results(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let drained = self.pool.drain(timeout).await;
        for row in drained.panicked {
            self.starting.remove(&row);
            self.stats.incr(keys::WORKER_RESULT_DROPPED);
            telemetry::record_worker_result_dropped("panicked", Some(row));
        }
        for result in &drained.results {
            self.starting.remove(&result.row);
        }
        if drained.results.is_empty() {
            return Ok(());
        }

        let rows: Vec<RowIndex> = drained.results.iter().map(|r| r.row).collect();
        let mut current: HashMap<RowIndex, JobRecord> = self
            .ledger
            .get_by_indices(&rows)
            .await?
            .into_iter()
            .map(|r| (r.row, r))
            .collect();

        let mut touched = Vec::new();
        for result in drained.results {
            self.stats.merge(&result.stats);
            let Some(record) = current.get_mut(&result.row) else {
                self.stats.incr(keys::WORKER_RESULT_DROPPED);
                telemetry::record_worker_result_dropped("unknown_row", Some(result.row));
                continue;
            };
            if record.id.as_deref() != Some(result.job_id.as_str()) {
                self.stats.incr(keys::WORKER_RESULT_DROPPED);
                telemetry::record_worker_result_dropped("job_mismatch", Some(result.row));
                continue;
            }

            let patch = match record.status {
                JobStatus::QueuedForStart | JobStatus::Created => result.update,
                status => {
                    tracing::debug!(row = %result.row, status = %status, "row moved on, ignoring task status");
                    result.update.without_status()
                }
            };
            if let Some(status) = patch.status {
                if status != record.status {
                    let backend = record.backend_name.clone().unwrap_or_default();
                    telemetry::record_status_transition(&backend, record.row, Some(&result.job_id), record.status, status);
                }
            }
            record.apply(&patch);
            self.stats.incr(keys::WORKER_RESULT_MERGED);
            touched.push(result.row);
        }

        let updated: Vec<JobRecord> = touched
            .iter()
            .filter_map(|row| current.get(row).cloned())
            .collect();
        self.persist(&updated).await
    }
}

/// Copy usage and costs from a job description onto the record.
fn apply_usage(record: &mut JobRecord, description: &JobDescription) {
    for (name, metric) in &description.usage {
        let rendered = Some(metric.to_string());
        match name.as_str() {
            "cpu" => record.cpu = rendered,
            "memory" => record.memory = rendered,
            "duration" => record.duration = rendered,
            _ => {}
        }
    }
    if description.costs.is_some() {
        record.costs = description.costs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::time::timeout;

    use crate::backend::UsageMetric;
    use crate::config::RetryConfig;
    use crate::job::JobPatch;
    use crate::ledger::{InMemoryLedger, LedgerSchema};
    use crate::runtime::lifecycle::NoopLifecycle;
    use crate::runtime::worker::{Task, TaskResult};

    /// Task that hands back a prepared result.
    #[derive(Debug)]
    struct Completed(TaskResult);

    #[async_trait]
    impl Task for Completed {
        fn job_id(&self) -> &str {
            &self.0.job_id
        }

        fn row(&self) -> RowIndex {
            self.0.row
        }

        async fn execute(self: Box<Self>) -> TaskResult {
            self.0
        }
    }

    fn tracked(row: usize, job_id: &str, status: JobStatus) -> JobRecord {
        let mut record = JobRecord::new(row).with_status(status).with_backend("foo");
        record.id = Some(job_id.to_string());
        record
    }

    fn run_over(records: Vec<JobRecord>) -> JobRun {
        let starter: Arc<dyn JobStarter> =
            Arc::new(CreateJobStarter::new(|_record: &JobRecord, _backend: &str| None));
        JobRun {
            run_id: "test-run".to_string(),
            config: OrchestratorConfig::default(),
            backends: Arc::new(BackendRegistry::new(RetryConfig::default())),
            starter,
            lifecycle: Arc::new(NoopLifecycle),
            ledger: Arc::new(InMemoryLedger::with_records(LedgerSchema::default(), records)),
            pool: WorkerPool::new(1),
            stats: Stats::new(),
            cancel_requested: HashSet::new(),
            starting: HashSet::new(),
            iteration: 0,
        }
    }

    async fn stored(run: &JobRun, row: usize) -> JobRecord {
        run.ledger
            .get_by_indices(&[RowIndex(row)])
            .await
            .unwrap()
            .pop()
            .expect("row should exist")
    }

    fn queued(job_id: &str, row: usize) -> Box<dyn Task> {
        Box::new(Completed(TaskResult::success(
            job_id,
            RowIndex(row),
            JobPatch::status(JobStatus::Queued),
            keys::JOB_START,
        )))
    }

    #[tokio::test]
    async fn test_results_for_unknown_rows_or_other_jobs_are_dropped() {
        let mut run = run_over(vec![tracked(0, "job-0", JobStatus::QueuedForStart)]);
        run.starting.insert(RowIndex(0));
        run.pool.submit(queued("job-7", 7)).unwrap();
        run.pool.submit(queued("job-other", 0)).unwrap();

        run.collect_results(Duration::from_secs(5)).await.unwrap();

        assert_eq!(run.stats.get(keys::WORKER_RESULT_DROPPED), 2);
        assert_eq!(run.stats.get(keys::WORKER_RESULT_MERGED), 0);
        assert_eq!(run.stats.get(keys::JOB_DB_PERSIST), 0);
        assert_eq!(stored(&run, 0).await.status, JobStatus::QueuedForStart);
        assert_eq!(run.pending_tasks(), 0);
        assert!(run.starting.is_empty());
        run.pool.shutdown().await;
    }

    #[derive(Debug)]
    struct Exploding(RowIndex);

    #[async_trait]
    impl Task for Exploding {
        fn job_id(&self) -> &str {
            "job-0"
        }

        fn row(&self) -> RowIndex {
            self.0
        }

        async fn execute(self: Box<Self>) -> TaskResult {
            panic!("start call exploded");
        }
    }

    #[tokio::test]
    async fn test_panicked_start_releases_row_for_resubmission() {
        let mut run = run_over(vec![tracked(0, "job-0", JobStatus::QueuedForStart)]);
        run.starting.insert(RowIndex(0));
        run.pool.submit(Box::new(Exploding(RowIndex(0)))).unwrap();

        run.collect_results(Duration::from_secs(5)).await.unwrap();

        assert!(!run.starting.contains(&RowIndex(0)));
        assert_eq!(run.stats.get(keys::WORKER_RESULT_DROPPED), 1);
        assert_eq!(stored(&run, 0).await.status, JobStatus::QueuedForStart);
        run.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_task_status_does_not_regress_row() {
        let mut running = tracked(0, "job-0", JobStatus::Running);
        running.running_start_time = Some(Utc::now());
        let mut run = run_over(vec![
            running,
            tracked(1, "job-1", JobStatus::QueuedForStart),
        ]);
        let mut late = TaskResult::success(
            "job-0",
            RowIndex(0),
            JobPatch::status(JobStatus::Queued),
            keys::JOB_START,
        );
        late.update.cpu = Some("3 cpu-seconds".to_string());
        run.pool.submit(Box::new(Completed(late))).unwrap();
        run.pool.submit(queued("job-1", 1)).unwrap();

        run.collect_results(Duration::from_secs(5)).await.unwrap();

        let row = stored(&run, 0).await;
        assert_eq!(row.status, JobStatus::Running);
        assert_eq!(row.cpu.as_deref(), Some("3 cpu-seconds"));
        assert_eq!(stored(&run, 1).await.status, JobStatus::Queued);
        assert_eq!(run.stats.get(keys::WORKER_RESULT_MERGED), 2);
        assert_eq!(run.stats.get(keys::WORKER_RESULT_DROPPED), 0);
        assert_eq!(run.stats.get(keys::JOB_START), 2);
        run.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("waiter panicked");
        }
    }

    #[test]
    fn test_shutdown_token_default_not_cancelled() {
        assert!(!ShutdownToken::default().is_cancelled());
    }

    #[test]
    fn test_apply_usage_renders_value_and_unit() {
        let mut record = JobRecord::new(0);
        record.costs = Some(1.0);
        let description = JobDescription {
            status: "running".into(),
            usage: BTreeMap::from([
                (
                    "cpu".to_string(),
                    UsageMetric {
                        value: 12.5,
                        unit: "cpu-seconds".into(),
                    },
                ),
                (
                    "memory".to_string(),
                    UsageMetric {
                        value: 2048.0,
                        unit: "mb-seconds".into(),
                    },
                ),
                (
                    "network".to_string(),
                    UsageMetric {
                        value: 1.0,
                        unit: "gb".into(),
                    },
                ),
            ]),
            costs: None,
            metadata: serde_json::Value::Null,
        };

        apply_usage(&mut record, &description);
        assert_eq!(record.cpu.as_deref(), Some("12.5 cpu-seconds"));
        assert_eq!(record.memory.as_deref(), Some("2048 mb-seconds"));
        assert_eq!(record.duration, None);
        assert_eq!(record.costs, Some(1.0));
    }
}
