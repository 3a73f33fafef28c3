use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::ledger::wkt::Geometry;

/// Identity of a row in the job ledger.
///
/// Rows are never deleted, so the index assigned when the ledger is first
/// initialized stays valid for the lifetime of the ledger.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct RowIndex(pub usize);

impl Display for RowIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for RowIndex {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a job record.
///
/// `not_started` rows are launched by the orchestrator; the in-flight states
/// are polled from the remote backend until one of the terminal states is
/// reached.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Created,
    QueuedForStart,
    Queued,
    Running,
    Finished,
    Error,
    Canceled,
    StartFailed,
    QueuedForStartFailed,
    Skipped,
}

impl JobStatus {
    /// States that occupy a backend's run capacity.
    pub const ACTIVE: [JobStatus; 4] = [
        JobStatus::Created,
        JobStatus::QueuedForStart,
        JobStatus::Queued,
        JobStatus::Running,
    ];

    /// States that keep an orchestration run alive.
    pub const NON_TERMINAL: [JobStatus; 5] = [
        JobStatus::NotStarted,
        JobStatus::Created,
        JobStatus::QueuedForStart,
        JobStatus::Queued,
        JobStatus::Running,
    ];

    pub const ALL: [JobStatus; 11] = [
        JobStatus::NotStarted,
        JobStatus::Created,
        JobStatus::QueuedForStart,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Error,
        JobStatus::Canceled,
        JobStatus::StartFailed,
        JobStatus::QueuedForStartFailed,
        JobStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Created => "created",
            JobStatus::QueuedForStart => "queued_for_start",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
            JobStatus::StartFailed => "start_failed",
            JobStatus::QueuedForStartFailed => "queued_for_start_failed",
            JobStatus::Skipped => "skipped",
        }
    }

    /// No further automatic transition is expected from a terminal state.
    pub fn is_terminal(&self) -> bool {
        !Self::NON_TERMINAL.contains(self)
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Parse a status string as reported by a remote backend.
    ///
    /// Backends only ever report a subset of the ledger states; the
    /// orchestrator-owned states are rejected here.
    pub fn from_backend(status: &str) -> Result<Self, BackendError> {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "error" => Ok(JobStatus::Error),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            _ => Err(BackendError::UnknownStatus(status.to_string())),
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(JobStatus::NotStarted),
            "created" => Ok(JobStatus::Created),
            "queued_for_start" => Ok(JobStatus::QueuedForStart),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            "start_failed" => Ok(JobStatus::StartFailed),
            "queued_for_start_failed" => Ok(JobStatus::QueuedForStartFailed),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Value of a caller-defined ledger column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Geometry(Geometry),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Int(v) => Some(*v as f64),
            ColumnValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => Ok(()),
            ColumnValue::Bool(v) => write!(f, "{v}"),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => f.write_str(v),
            ColumnValue::Geometry(g) => write!(f, "{g}"),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Bool(value)
    }
}

impl From<Geometry> for ColumnValue {
    fn from(value: Geometry) -> Self {
        ColumnValue::Geometry(value)
    }
}

/// Caller-defined columns, keyed by column name.
pub type ColumnMap = BTreeMap<String, ColumnValue>;

/// One row of the job ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub row: RowIndex,
    /// Remote job id; unset until the backend assigns one.
    pub id: Option<String>,
    pub backend_name: Option<String>,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub running_start_time: Option<DateTime<Utc>>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub duration: Option<String>,
    pub costs: Option<f64>,
    pub columns: ColumnMap,
}

impl JobRecord {
    pub fn new(row: usize) -> Self {
        Self {
            row: RowIndex(row),
            ..Default::default()
        }
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        value: impl Into<ColumnValue>,
    ) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_backend(mut self, backend_name: impl Into<String>) -> Self {
        self.backend_name = Some(backend_name.into());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name)
    }

    /// Record the id handed out by the backend on job creation.
    ///
    /// Returns `false` (and leaves the record untouched) when a different id
    /// was already assigned.
    pub fn assign_remote_id(&mut self, job_id: impl Into<String>) -> bool {
        let job_id = job_id.into();
        match &self.id {
            Some(existing) if *existing != job_id => false,
            _ => {
                self.id = Some(job_id);
                true
            }
        }
    }

    /// Upsert `incoming` into this record.
    ///
    /// Set fields of `incoming` win, unset fields never blank out existing
    /// values, and caller columns are merged key by key.
    pub fn merge(&mut self, incoming: &JobRecord) {
        if let Some(id) = &incoming.id {
            self.assign_remote_id(id.clone());
        }
        self.status = incoming.status;
        merge_field(&mut self.backend_name, &incoming.backend_name);
        merge_field(&mut self.start_time, &incoming.start_time);
        merge_field(&mut self.running_start_time, &incoming.running_start_time);
        merge_field(&mut self.cpu, &incoming.cpu);
        merge_field(&mut self.memory, &incoming.memory);
        merge_field(&mut self.duration, &incoming.duration);
        merge_field(&mut self.costs, &incoming.costs);
        for (name, value) in &incoming.columns {
            self.columns.insert(name.clone(), value.clone());
        }
    }

    /// Apply a partial update produced outside the control loop.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(id) = &patch.id {
            self.assign_remote_id(id.clone());
        }
        merge_field(&mut self.backend_name, &patch.backend_name);
        merge_field(&mut self.start_time, &patch.start_time);
        merge_field(&mut self.running_start_time, &patch.running_start_time);
        merge_field(&mut self.cpu, &patch.cpu);
        merge_field(&mut self.memory, &patch.memory);
        merge_field(&mut self.duration, &patch.duration);
        merge_field(&mut self.costs, &patch.costs);
        for (name, value) in &patch.columns {
            self.columns.insert(name.clone(), value.clone());
        }
    }
}

fn merge_field<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value.clone());
    }
}

/// Partial field update for a ledger row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub id: Option<String>,
    pub backend_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub running_start_time: Option<DateTime<Utc>>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub duration: Option<String>,
    pub costs: Option<f64>,
    pub columns: ColumnMap,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == JobPatch::default()
    }

    /// The same patch without its status change.
    pub fn without_status(&self) -> Self {
        Self {
            status: None,
            ..self.clone()
        }
    }
}
