use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendConnection, ResilientConnection};
use crate::capacity::BackendCapacity;
use crate::config::RetryConfig;
use crate::error::{BackendError, ConfigError};

/// Zero-argument factory producing a backend connection on first use.
pub type ConnectionFactory =
    Arc<dyn Fn() -> Result<Arc<dyn BackendConnection>, BackendError> + Send + Sync>;

/// Where a backend's connection comes from.
#[derive(Clone)]
pub enum ConnectionSource {
    /// An already-built connection.
    Direct(Arc<dyn BackendConnection>),
    /// Built lazily, the first time the backend is used.
    Factory(ConnectionFactory),
}

impl ConnectionSource {
    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn BackendConnection>, BackendError> + Send + Sync + 'static,
    {
        ConnectionSource::Factory(Arc::new(factory))
    }
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSource::Direct(conn) => {
                f.debug_tuple("Direct").field(&conn.root_url()).finish()
            }
            ConnectionSource::Factory(_) => f.write_str("Factory"),
        }
    }
}

impl From<Arc<dyn BackendConnection>> for ConnectionSource {
    fn from(connection: Arc<dyn BackendConnection>) -> Self {
        ConnectionSource::Direct(connection)
    }
}

/// Registration request for one backend.
#[derive(Clone, Debug)]
pub struct BackendSpec {
    pub name: String,
    pub source: ConnectionSource,
    pub parallel_jobs: usize,
    pub queueing_limit: usize,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, source: impl Into<ConnectionSource>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            parallel_jobs: 2,
            queueing_limit: 10,
        }
    }

    pub fn with_parallel_jobs(mut self, parallel_jobs: usize) -> Self {
        self.parallel_jobs = parallel_jobs;
        self
    }

    pub fn with_queueing_limit(mut self, queueing_limit: usize) -> Self {
        self.queueing_limit = queueing_limit;
        self
    }
}

/// A registered backend.
///
/// The connection source is resolved and wrapped with retry handling at most
/// once; later calls return the memoized connection.
pub struct Backend {
    name: String,
    source: ConnectionSource,
    capacity: BackendCapacity,
    retry: RetryConfig,
    connection: Mutex<Option<Arc<dyn BackendConnection>>>,
    last_token_refresh: Mutex<Option<Instant>>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("capacity", &self.capacity)
            .field("resolved", &self.connection.lock().is_some())
            .finish()
    }
}

impl Backend {
    fn new(spec: BackendSpec, retry: RetryConfig) -> Self {
        Self {
            name: spec.name,
            source: spec.source,
            capacity: BackendCapacity::new(spec.parallel_jobs, spec.queueing_limit),
            retry,
            connection: Mutex::new(None),
            last_token_refresh: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> BackendCapacity {
        self.capacity
    }

    /// Resolve, wrap and memoize the backend connection.
    pub fn connection(&self) -> Result<Arc<dyn BackendConnection>, BackendError> {
        let mut guard = self.connection.lock();
        if let Some(connection) = guard.as_ref() {
            return Ok(Arc::clone(connection));
        }

        let raw = match &self.source {
            ConnectionSource::Direct(connection) => Arc::clone(connection),
            ConnectionSource::Factory(factory) => {
                tracing::debug!(backend = %self.name, "building backend connection");
                factory()?
            }
        };
        let connection = ResilientConnection::wrap(raw, self.retry.clone());
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Claim the right to refresh this backend's access token.
    ///
    /// Returns `true` at most once per `min_interval`.
    pub fn claim_token_refresh(&self, min_interval: Duration) -> bool {
        let mut last = self.last_token_refresh.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Named remote execution targets, in registration order.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    retry: RetryConfig,
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl BackendRegistry {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            backends: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend under a unique name.
    pub fn add_backend(&self, spec: BackendSpec) -> Result<(), ConfigError> {
        if spec.parallel_jobs == 0 || spec.queueing_limit == 0 {
            return Err(ConfigError::InvalidCapacity { name: spec.name });
        }
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.name == spec.name) {
            return Err(ConfigError::DuplicateBackend(spec.name));
        }
        tracing::info!(
            backend = %spec.name,
            parallel_jobs = spec.parallel_jobs,
            queueing_limit = spec.queueing_limit,
            "registered backend"
        );
        backends.push(Arc::new(Backend::new(spec, self.retry.clone())));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().iter().find(|b| b.name == name).cloned()
    }

    /// Snapshot of all backends in registration order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.read().iter().map(|b| b.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn ensure_not_empty(&self) -> Result<(), ConfigError> {
        if self.is_empty() {
            Err(ConfigError::NoBackends)
        } else {
            Ok(())
        }
    }

    /// Memoized connection of the named backend.
    pub fn connection(&self, name: &str) -> anyhow::Result<Arc<dyn BackendConnection>> {
        let backend = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))?;
        Ok(backend.connection()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::backend::{Connector, JobDescription, LogEntry, LogLevel, RemoteJob};

    struct StaticConnection;

    #[async_trait]
    impl BackendConnection for StaticConnection {
        fn root_url(&self) -> &str {
            "https://static.test"
        }

        fn access_token(&self) -> Option<String> {
            None
        }

        fn connector(&self) -> Arc<dyn Connector> {
            unimplemented!("not used by registry tests")
        }

        async fn refresh_access_token(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn create_job(&self, _payload: &serde_json::Value) -> Result<RemoteJob, BackendError> {
            Ok(RemoteJob::new("j"))
        }

        async fn job_status(&self, _job_id: &str) -> Result<String, BackendError> {
            Ok("created".into())
        }

        async fn describe_job(&self, _job_id: &str) -> Result<JobDescription, BackendError> {
            Ok(JobDescription::with_status("created"))
        }

        async fn start_job(&self, _job_id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn stop_job(&self, _job_id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn job_logs(&self, _job_id: &str, _level: LogLevel) -> Result<Vec<LogEntry>, BackendError> {
            Ok(Vec::new())
        }

        async fn download_results(
            &self,
            _job_id: &str,
            _target: &Path,
        ) -> Result<Vec<PathBuf>, BackendError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_factory_resolved_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = BackendRegistry::new(RetryConfig::default());
        registry
            .add_backend(BackendSpec::new(
                "foo",
                ConnectionSource::factory(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(StaticConnection) as Arc<dyn BackendConnection>)
                }),
            ))
            .unwrap();

        let first = registry.connection("foo").unwrap();
        let second = registry.connection("foo").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_resilient());
    }

    #[test]
    fn test_direct_connection_is_wrapped() {
        let registry = BackendRegistry::new(RetryConfig::default());
        let conn: Arc<dyn BackendConnection> = Arc::new(StaticConnection);
        registry.add_backend(BackendSpec::new("bar", conn)).unwrap();
        assert!(registry.connection("bar").unwrap().is_resilient());
    }

    #[test]
    fn test_duplicate_and_unknown_backends() {
        let registry = BackendRegistry::new(RetryConfig::default());
        assert_eq!(registry.ensure_not_empty(), Err(ConfigError::NoBackends));

        let conn: Arc<dyn BackendConnection> = Arc::new(StaticConnection);
        registry
            .add_backend(BackendSpec::new("foo", conn.clone()))
            .unwrap();
        assert_eq!(
            registry.add_backend(BackendSpec::new("foo", conn.clone())),
            Err(ConfigError::DuplicateBackend("foo".into()))
        );
        assert_eq!(
            registry.add_backend(BackendSpec::new("zero", conn).with_parallel_jobs(0)),
            Err(ConfigError::InvalidCapacity {
                name: "zero".into()
            })
        );
        assert!(registry.connection("nope").is_err());
        assert_eq!(registry.names(), vec!["foo".to_string()]);
    }

    #[test]
    fn test_token_refresh_is_throttled() {
        let registry = BackendRegistry::new(RetryConfig::default());
        let conn: Arc<dyn BackendConnection> = Arc::new(StaticConnection);
        registry.add_backend(BackendSpec::new("foo", conn)).unwrap();
        let backend = registry.get("foo").unwrap();

        assert!(backend.claim_token_refresh(Duration::from_secs(60)));
        assert!(!backend.claim_token_refresh(Duration::from_secs(60)));
        assert!(backend.claim_token_refresh(Duration::ZERO));
    }
}
