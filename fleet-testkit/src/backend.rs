use async_trait::async_trait;
use fleet::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend operations that can be counted or made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    Refresh,
    Create,
    Status,
    Describe,
    Start,
    Stop,
    Logs,
    Download,
}

#[derive(Clone, Debug, Default)]
struct ScriptedJob {
    payload: serde_json::Value,
    started: bool,
    stopped: bool,
    polls: usize,
}

#[derive(Default)]
struct State {
    next_id: usize,
    jobs: BTreeMap<String, ScriptedJob>,
    script: Vec<String>,
    usage: BTreeMap<String, UsageMetric>,
    costs: Option<f64>,
    failures: HashMap<Op, VecDeque<BackendError>>,
    calls: HashMap<Op, usize>,
    tokens_seen: Vec<Option<String>>,
}

/// In-process backend whose jobs follow a fixed status script.
///
/// Jobs report `created` until started. Once started, every `describe_job`
/// call advances the job one step through the script; the last entry
/// repeats forever. `stop_job` turns a job `canceled`. Clones share state,
/// so a test can keep one handle for inspection while the orchestrator owns
/// another.
#[derive(Clone)]
pub struct ScriptedBackend {
    root_url: String,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScriptedBackend")
            .field("root_url", &self.root_url)
            .field("jobs", &state.jobs.len())
            .field("script", &state.script)
            .finish()
    }
}

impl ScriptedBackend {
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into(),
            state: Arc::new(Mutex::new(State {
                script: vec!["finished".to_string()],
                ..Default::default()
            })),
        }
    }

    /// Statuses reported by started jobs, one per describe call.
    pub fn with_script<I, S>(self, script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().script = script.into_iter().map(Into::into).collect();
        self
    }

    /// Usage metric reported by every describe call.
    pub fn with_usage(self, name: &str, value: f64, unit: &str) -> Self {
        self.state.lock().usage.insert(
            name.to_string(),
            UsageMetric {
                value,
                unit: unit.to_string(),
            },
        );
        self
    }

    pub fn with_costs(self, costs: f64) -> Self {
        self.state.lock().costs = Some(costs);
        self
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail(&self, op: Op, error: BackendError, times: usize) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// This backend as a trait object, ready for [`BackendSpec::new`].
    pub fn connection(&self) -> Arc<dyn BackendConnection> {
        Arc::new(self.clone())
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.state.lock().jobs.keys().cloned().collect()
    }

    pub fn payload(&self, job_id: &str) -> Option<serde_json::Value> {
        self.state.lock().jobs.get(job_id).map(|j| j.payload.clone())
    }

    pub fn is_started(&self, job_id: &str) -> bool {
        self.state.lock().jobs.get(job_id).is_some_and(|j| j.started)
    }

    /// Bearer tokens handed to [`Connector::connect`], in call order.
    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.state.lock().tokens_seen.clone()
    }

    fn enter(&self, op: Op) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => {
                tracing::debug!(?op, %error, "scripted failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn current_status(script: &[String], job: &ScriptedJob) -> String {
        if job.stopped {
            return "canceled".to_string();
        }
        if !job.started {
            return "created".to_string();
        }
        let step = job.polls.min(script.len().saturating_sub(1));
        script
            .get(step)
            .cloned()
            .unwrap_or_else(|| "finished".to_string())
    }

    fn not_found(job_id: &str) -> BackendError {
        BackendError::api(404, "JobNotFound", format!("job {job_id} does not exist"))
    }
}

#[async_trait]
impl BackendConnection for ScriptedBackend {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    fn access_token(&self) -> Option<String> {
        Some("scripted-token".to_string())
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    async fn refresh_access_token(&self) -> Result<(), BackendError> {
        self.enter(Op::Refresh)
    }

    async fn create_job(&self, payload: &serde_json::Value) -> Result<RemoteJob, BackendError> {
        self.enter(Op::Create)?;
        let mut state = self.state.lock();
        let job_id = format!("job-{}", state.next_id);
        state.next_id += 1;
        state.jobs.insert(
            job_id.clone(),
            ScriptedJob {
                payload: payload.clone(),
                ..Default::default()
            },
        );
        Ok(RemoteJob::new(job_id))
    }

    async fn job_status(&self, job_id: &str) -> Result<String, BackendError> {
        self.enter(Op::Status)?;
        let state = self.state.lock();
        let job = state.jobs.get(job_id).ok_or_else(|| Self::not_found(job_id))?;
        Ok(Self::current_status(&state.script, job))
    }

    async fn describe_job(&self, job_id: &str) -> Result<JobDescription, BackendError> {
        self.enter(Op::Describe)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::not_found(job_id))?;
        let status = Self::current_status(&state.script, job);
        if job.started {
            job.polls += 1;
        }
        Ok(JobDescription {
            status,
            usage: state.usage.clone(),
            costs: state.costs,
            metadata: serde_json::json!({ "id": job_id, "process": job.payload }),
        })
    }

    async fn start_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.enter(Op::Start)?;
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::not_found(job_id))?;
        job.started = true;
        Ok(())
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.enter(Op::Stop)?;
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Self::not_found(job_id))?;
        job.stopped = true;
        Ok(())
    }

    async fn job_logs(&self, job_id: &str, level: LogLevel) -> Result<Vec<LogEntry>, BackendError> {
        self.enter(Op::Logs)?;
        Ok(vec![LogEntry {
            id: format!("{job_id}-log-0"),
            level,
            message: format!("scripted failure of {job_id}"),
        }])
    }

    async fn download_results(
        &self,
        job_id: &str,
        target: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        self.enter(Op::Download)?;
        let path = target.join("result.json");
        let body = serde_json::json!({ "job_id": job_id }).to_string();
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| BackendError::connection(err.to_string()))?;
        Ok(vec![path])
    }
}

impl Connector for ScriptedBackend {
    fn connect(
        &self,
        _root_url: &str,
        access_token: Option<&str>,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        self.enter(Op::Connect)?;
        self.state
            .lock()
            .tokens_seen
            .push(access_token.map(str::to_string));
        Ok(Arc::new(self.clone()))
    }
}
