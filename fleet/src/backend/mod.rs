//! Remote execution backends.
//!
//! The wire protocol to a backend is not implemented here: callers plug in a
//! [`BackendConnection`] for their API of choice. This module adds the pieces
//! the orchestrator needs around it, namely retry/backoff for transient HTTP
//! failures ([`ResilientConnection`]) and a registry of named backends with
//! their capacity budget ([`BackendRegistry`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Named backend registry with memoized connections.
pub mod registry;
/// Retry/backoff wrapper for backend connections.
pub mod resilient;

pub use registry::{Backend, BackendRegistry, BackendSpec, ConnectionFactory, ConnectionSource};
pub use resilient::{ResilientConnection, ResilientConnector};

/// HTTP method a backend operation maps onto.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Head,
    Get,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Head => "HEAD",
            HttpMethod::Get => "GET",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Handle to a job created on a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub job_id: String,
}

impl RemoteJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}

/// One usage metric reported by a backend, e.g. `cpu: 12.5 cpu-seconds`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageMetric {
    pub value: f64,
    pub unit: String,
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Result of describing a remote job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub status: String,
    #[serde(default)]
    pub usage: BTreeMap<String, UsageMetric>,
    #[serde(default)]
    pub costs: Option<f64>,
    /// Full metadata document as returned by the backend.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobDescription {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Severity filter for job logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

/// One log entry of a remote job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub level: LogLevel,
    pub message: String,
}

/// Client for one remote execution backend.
///
/// Each method corresponds to one HTTP request against the backend API; the
/// method it maps onto is listed so the retry policy can tell which calls
/// are safe to repeat.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Base URL of the backend API.
    fn root_url(&self) -> &str;

    /// Current bearer token, if the connection is authenticated.
    fn access_token(&self) -> Option<String>;

    /// Builds independent connections to the same backend, used by start
    /// tasks running off the control loop.
    fn connector(&self) -> Arc<dyn Connector>;

    /// Whether this connection already carries retry/backoff handling.
    fn is_resilient(&self) -> bool {
        false
    }

    /// `POST`: refresh the access token.
    async fn refresh_access_token(&self) -> Result<(), BackendError>;

    /// `POST`: create a job from an opaque process graph payload.
    async fn create_job(&self, payload: &serde_json::Value) -> Result<RemoteJob, BackendError>;

    /// `GET`: current status string of a job.
    async fn job_status(&self, job_id: &str) -> Result<String, BackendError>;

    /// `GET`: status, usage and costs of a job.
    async fn describe_job(&self, job_id: &str) -> Result<JobDescription, BackendError>;

    /// `POST`: start processing a created job.
    async fn start_job(&self, job_id: &str) -> Result<(), BackendError>;

    /// `DELETE`: stop a queued or running job.
    async fn stop_job(&self, job_id: &str) -> Result<(), BackendError>;

    /// `GET`: job logs at or above `level`.
    async fn job_logs(&self, job_id: &str, level: LogLevel) -> Result<Vec<LogEntry>, BackendError>;

    /// `GET`: download all result assets of a finished job into `target`.
    async fn download_results(
        &self,
        job_id: &str,
        target: &Path,
    ) -> Result<Vec<PathBuf>, BackendError>;
}

/// Creates connections to a backend from its endpoint and credentials.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        root_url: &str,
        access_token: Option<&str>,
    ) -> Result<Arc<dyn BackendConnection>, BackendError>;
}
