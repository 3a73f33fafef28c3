use std::path::PathBuf;

use crate::backend::HttpMethod;

/// Errors raised by a remote execution backend or the connection to it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Network or connection level failure; the request may not have
    /// reached the backend at all.
    #[error("connection error: {0}")]
    Connection(String),

    /// Well-formed error response from the backend API.
    #[error("API error {status} [{code}]: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The resilient connection gave up after its retry budget.
    #[error("{method} {operation}: giving up after {attempts} attempts (last status {status})")]
    RetriesExhausted {
        method: HttpMethod,
        operation: String,
        status: u16,
        attempts: u32,
    },

    /// The backend reported a job status this crate does not understand.
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
}

impl BackendError {
    pub fn connection(message: impl Into<String>) -> Self {
        BackendError::Connection(message.into())
    }

    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, BackendError::Connection(_))
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, BackendError::RetriesExhausted { .. })
    }

    /// HTTP status of the failed response, if there was one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            BackendError::RetriesExhausted { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised by job ledger backing stores.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("malformed ledger {location}: {message}")]
    Malformed { location: String, message: String },

    #[error("unsupported ledger format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("ledger already exists: {0}")]
    AlreadyExists(String),

    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn malformed(location: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Malformed {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Configuration problems detected before the control loop starts.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no backends registered")]
    NoBackends,

    #[error("backend {0:?} is already registered")]
    DuplicateBackend(String),

    #[error("unknown backend {0:?}")]
    UnknownBackend(String),

    #[error("backend {name:?} needs parallel_jobs > 0 and queueing_limit > 0")]
    InvalidCapacity { name: String },

    #[error("both caller rows/output path and a ledger object were supplied; pick one")]
    AmbiguousJobSource,

    #[error("no job source: supply caller rows or an initialized ledger")]
    MissingJobSource,

    #[error("no job starter configured")]
    MissingStarter,
}
