use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::Connector;
use crate::job::{JobPatch, JobStatus, RowIndex};
use crate::stats::{keys, Stats};
use crate::telemetry;

/// Unit of work executed off the control loop.
///
/// Tasks are self-contained: everything they need is moved in on
/// construction, and their only output is the returned [`TaskResult`].
#[async_trait]
pub trait Task: Send + fmt::Debug {
    fn job_id(&self) -> &str;

    fn row(&self) -> RowIndex;

    async fn execute(self: Box<Self>) -> TaskResult;
}

/// Outcome of a [`Task`], merged into the ledger by the control loop.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub job_id: String,
    pub row: RowIndex,
    pub success: bool,
    pub update: JobPatch,
    pub stats: Stats,
}

impl TaskResult {
    pub fn success(job_id: impl Into<String>, row: RowIndex, update: JobPatch, stat: &str) -> Self {
        Self {
            job_id: job_id.into(),
            row,
            success: true,
            update,
            stats: Stats::from_iter([(stat, 1)]),
        }
    }

    pub fn failure(job_id: impl Into<String>, row: RowIndex, update: JobPatch, stat: &str) -> Self {
        Self {
            success: false,
            ..Self::success(job_id, row, update, stat)
        }
    }
}

/// Starts a created job on its backend.
///
/// Carries the backend endpoint and bearer token instead of the control
/// loop's connection, and opens its own connection through `connector`.
pub struct StartJobTask {
    job_id: String,
    row: RowIndex,
    root_url: String,
    bearer_token: Option<String>,
    connector: Arc<dyn Connector>,
}

impl StartJobTask {
    pub fn new(
        job_id: impl Into<String>,
        row: RowIndex,
        root_url: impl Into<String>,
        bearer_token: Option<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            row,
            root_url: root_url.into(),
            bearer_token,
            connector,
        }
    }
}

impl fmt::Debug for StartJobTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartJobTask")
            .field("job_id", &self.job_id)
            .field("row", &self.row)
            .field("root_url", &self.root_url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl Task for StartJobTask {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn row(&self) -> RowIndex {
        self.row
    }

    async fn execute(self: Box<Self>) -> TaskResult {
        let started = self
            .connector
            .connect(&self.root_url, self.bearer_token.as_deref());
        let outcome = match started {
            Ok(connection) => connection.start_job(&self.job_id).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(job_id = %self.job_id, row = %self.row, "job started");
                TaskResult::success(
                    self.job_id,
                    self.row,
                    JobPatch::status(JobStatus::Queued),
                    keys::JOB_START,
                )
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, row = %self.row, error = %err, "failed to start job");
                TaskResult::failure(
                    self.job_id,
                    self.row,
                    JobPatch::status(JobStatus::StartFailed),
                    keys::START_JOB_ERROR,
                )
            }
        }
    }
}

/// Results collected by [`WorkerPool::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    pub results: Vec<TaskResult>,
    /// Rows of tasks that panicked; their updates are lost.
    pub panicked: Vec<RowIndex>,
}

enum Outcome {
    Completed(TaskResult),
    Panicked { job_id: String, row: RowIndex },
}

/// Small fixed-size pool of tokio workers executing [`Task`]s.
///
/// Every submitted task produces exactly one outcome, handed out exactly
/// once by [`drain`](Self::drain).
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Box<dyn Task>>>>,
    results: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outcome>>,
    pending: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.lock().len())
            .field("pending", &self.pending())
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `worker_count` workers (at least one) on the current runtime.
    pub fn new(worker_count: usize) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<Box<dyn Task>>();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));

        let handles = (0..worker_count.max(1))
            .map(|worker| {
                let tasks = Arc::clone(&task_rx);
                let results = result_tx.clone();
                tokio::spawn(async move { Self::worker_loop(worker, tasks, results).await })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(task_tx)),
            results: tokio::sync::Mutex::new(result_rx),
            pending: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(handles),
        }
    }

    async fn worker_loop(
        worker: usize,
        tasks: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Task>>>>,
        results: mpsc::UnboundedSender<Outcome>,
    ) {
        loop {
            let task = { tasks.lock().await.recv().await };
            let Some(task) = task else {
                tracing::debug!(worker, "worker shutting down");
                break;
            };

            let job_id = task.job_id().to_string();
            let row = task.row();
            let timing = telemetry::record_task_start();
            let run = telemetry::instrument_task(&job_id, row, task.execute());
            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => {
                    telemetry::record_task_end(timing, result.success);
                    Outcome::Completed(result)
                }
                Err(_) => {
                    tracing::error!(worker, job_id = %job_id, row = %row, "task panicked");
                    telemetry::record_task_end(timing, false);
                    Outcome::Panicked { job_id, row }
                }
            };
            if results.send(outcome).is_err() {
                tracing::warn!(worker, "result channel closed, discarding task outcome");
            }
        }
    }

    /// Queue a task for execution.
    pub fn submit(&self, task: Box<dyn Task>) -> anyhow::Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            anyhow::bail!("worker pool is shut down");
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("worker pool is not accepting tasks");
        }
        Ok(())
    }

    /// Submitted tasks whose outcome has not been drained yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Collect finished tasks.
    ///
    /// With a zero `timeout` only already finished tasks are returned.
    /// Otherwise waits until every pending task is done or `timeout`
    /// elapses, whichever comes first.
    pub async fn drain(&self, timeout: Duration) -> Drained {
        let mut drained = Drained::default();
        let mut results = self.results.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            while let Ok(outcome) = results.try_recv() {
                self.collect(outcome, &mut drained);
            }
            if timeout.is_zero() || self.pending() == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, results.recv()).await {
                Ok(Some(outcome)) => self.collect(outcome, &mut drained),
                Ok(None) | Err(_) => break,
            }
        }
        drained
    }

    fn collect(&self, outcome: Outcome, drained: &mut Drained) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Outcome::Completed(result) => drained.results.push(result),
            Outcome::Panicked { job_id, row } => {
                tracing::debug!(job_id = %job_id, row = %row, "discarding panicked task");
                drained.panicked.push(row);
            }
        }
    }

    /// Stop accepting tasks and wait for the workers to finish what they
    /// already picked up. Safe to call more than once.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!("worker task failed: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConnection;
    use crate::error::BackendError;

    #[derive(Debug)]
    struct SleepTask {
        row: usize,
        delay: Duration,
    }

    #[async_trait]
    impl Task for SleepTask {
        fn job_id(&self) -> &str {
            "sleep"
        }

        fn row(&self) -> RowIndex {
            RowIndex(self.row)
        }

        async fn execute(self: Box<Self>) -> TaskResult {
            tokio::time::sleep(self.delay).await;
            TaskResult::success("sleep", RowIndex(self.row), JobPatch::default(), "slept")
        }
    }

    #[derive(Debug)]
    struct PanicTask;

    #[async_trait]
    impl Task for PanicTask {
        fn job_id(&self) -> &str {
            "boom"
        }

        fn row(&self) -> RowIndex {
            RowIndex(0)
        }

        async fn execute(self: Box<Self>) -> TaskResult {
            panic!("task exploded");
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(
            &self,
            _root_url: &str,
            _access_token: Option<&str>,
        ) -> Result<Arc<dyn BackendConnection>, BackendError> {
            Err(BackendError::connection("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_drain_returns_every_result_once() {
        let pool = WorkerPool::new(2);
        for row in 0..5 {
            pool.submit(Box::new(SleepTask {
                row,
                delay: Duration::from_millis(5),
            }))
            .unwrap();
        }

        let drained = pool.drain(Duration::from_secs(5)).await;
        let mut rows: Vec<_> = drained.results.iter().map(|r| r.row.0).collect();
        rows.sort();
        assert_eq!(rows, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.pending(), 0);

        let again = pool.drain(Duration::ZERO).await;
        assert!(again.results.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_timeout_does_not_wait() {
        let pool = WorkerPool::new(1);
        pool.submit(Box::new(SleepTask {
            row: 0,
            delay: Duration::from_secs(30),
        }))
        .unwrap();

        let started = std::time::Instant::now();
        let drained = pool.drain(Duration::ZERO).await;
        assert!(drained.results.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.pending(), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let pool = WorkerPool::new(1);
        pool.submit(Box::new(PanicTask)).unwrap();
        pool.submit(Box::new(SleepTask {
            row: 1,
            delay: Duration::ZERO,
        }))
        .unwrap();

        let drained = pool.drain(Duration::from_secs(5)).await;
        assert_eq!(drained.panicked, vec![RowIndex(0)]);
        assert_eq!(drained.results.len(), 1);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(2);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool
            .submit(Box::new(SleepTask {
                row: 0,
                delay: Duration::ZERO,
            }))
            .is_err());
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_start_task_reports_failure() {
        let task = StartJobTask::new(
            "j-1",
            RowIndex(3),
            "https://backend.test",
            Some("secret".into()),
            Arc::new(RefusingConnector),
        );
        assert!(!format!("{task:?}").contains("secret"));

        let result = Box::new(task).execute().await;
        assert!(!result.success);
        assert_eq!(result.row, RowIndex(3));
        assert_eq!(result.update.status, Some(JobStatus::StartFailed));
        assert_eq!(result.stats.get(keys::START_JOB_ERROR), 1);
    }
}
