use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{
    BackendConnection, Connector, HttpMethod, JobDescription, LogEntry, LogLevel, RemoteJob,
};
use crate::config::RetryConfig;
use crate::error::BackendError;

/// Backend connection that retries transient HTTP failures.
///
/// Only responses whose status is in the policy's forcelist are retried, and
/// only for the allowed methods; the total number of retries is bounded.
/// Once the budget is spent the call fails with
/// [`BackendError::RetriesExhausted`].
pub struct ResilientConnection {
    inner: Arc<dyn BackendConnection>,
    policy: RetryConfig,
}

impl std::fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("root_url", &self.inner.root_url())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ResilientConnection {
    /// Wrap `inner`, unless it already retries on its own.
    pub fn wrap(
        inner: Arc<dyn BackendConnection>,
        policy: RetryConfig,
    ) -> Arc<dyn BackendConnection> {
        if inner.is_resilient() {
            return inner;
        }
        Arc::new(Self { inner, policy })
    }

    pub fn policy(&self) -> &RetryConfig {
        &self.policy
    }

    async fn call<T, F, Fut>(
        &self,
        method: HttpMethod,
        operation: &str,
        mut request: F,
    ) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut retries = 0u32;
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let status = match err.http_status() {
                        Some(status) if self.policy.is_retryable(method, status) => status,
                        _ => return Err(err),
                    };
                    if retries >= self.policy.total {
                        tracing::warn!(
                            %method,
                            operation,
                            status,
                            attempts = retries + 1,
                            "retry budget exhausted"
                        );
                        return Err(BackendError::RetriesExhausted {
                            method,
                            operation: operation.to_string(),
                            status,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    let delay = self.policy.backoff(retries);
                    tracing::debug!(
                        %method,
                        operation,
                        status,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying transient backend failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl BackendConnection for ResilientConnection {
    fn root_url(&self) -> &str {
        self.inner.root_url()
    }

    fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ResilientConnector::new(
            self.inner.connector(),
            self.policy.clone(),
        ))
    }

    fn is_resilient(&self) -> bool {
        true
    }

    async fn refresh_access_token(&self) -> Result<(), BackendError> {
        self.call(HttpMethod::Post, "refresh_access_token", || {
            self.inner.refresh_access_token()
        })
        .await
    }

    async fn create_job(&self, payload: &serde_json::Value) -> Result<RemoteJob, BackendError> {
        self.call(HttpMethod::Post, "create_job", || self.inner.create_job(payload))
            .await
    }

    async fn job_status(&self, job_id: &str) -> Result<String, BackendError> {
        self.call(HttpMethod::Get, "job_status", || self.inner.job_status(job_id))
            .await
    }

    async fn describe_job(&self, job_id: &str) -> Result<JobDescription, BackendError> {
        self.call(HttpMethod::Get, "describe_job", || self.inner.describe_job(job_id))
            .await
    }

    async fn start_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.call(HttpMethod::Post, "start_job", || self.inner.start_job(job_id))
            .await
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.call(HttpMethod::Delete, "stop_job", || self.inner.stop_job(job_id))
            .await
    }

    async fn job_logs(&self, job_id: &str, level: LogLevel) -> Result<Vec<LogEntry>, BackendError> {
        self.call(HttpMethod::Get, "job_logs", || self.inner.job_logs(job_id, level))
            .await
    }

    async fn download_results(
        &self,
        job_id: &str,
        target: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        self.call(HttpMethod::Get, "download_results", || {
            self.inner.download_results(job_id, target)
        })
        .await
    }
}

/// Connector whose connections are wrapped in [`ResilientConnection`].
pub struct ResilientConnector {
    inner: Arc<dyn Connector>,
    policy: RetryConfig,
}

impl ResilientConnector {
    pub fn new(inner: Arc<dyn Connector>, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }
}

impl Connector for ResilientConnector {
    fn connect(
        &self,
        root_url: &str,
        access_token: Option<&str>,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        let connection = self.inner.connect(root_url, access_token)?;
        Ok(ResilientConnection::wrap(connection, self.policy.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    /// Connection whose `job_status`/`stop_job` replay a scripted sequence.
    struct FlakyConnection {
        responses: Mutex<VecDeque<Result<String, BackendError>>>,
        calls: AtomicU32,
    }

    impl FlakyConnection {
        fn new(responses: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn next(&self) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("running".to_string()))
        }
    }

    struct NoConnector;

    impl Connector for NoConnector {
        fn connect(
            &self,
            _root_url: &str,
            _access_token: Option<&str>,
        ) -> Result<Arc<dyn BackendConnection>, BackendError> {
            Err(BackendError::connection("not supported in test"))
        }
    }

    #[async_trait]
    impl BackendConnection for FlakyConnection {
        fn root_url(&self) -> &str {
            "https://flaky.test"
        }

        fn access_token(&self) -> Option<String> {
            None
        }

        fn connector(&self) -> Arc<dyn Connector> {
            Arc::new(NoConnector)
        }

        async fn refresh_access_token(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn create_job(&self, _payload: &serde_json::Value) -> Result<RemoteJob, BackendError> {
            Ok(RemoteJob::new("j-1"))
        }

        async fn job_status(&self, _job_id: &str) -> Result<String, BackendError> {
            self.next()
        }

        async fn describe_job(&self, job_id: &str) -> Result<JobDescription, BackendError> {
            Ok(JobDescription::with_status(self.job_status(job_id).await?))
        }

        async fn start_job(&self, _job_id: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn stop_job(&self, _job_id: &str) -> Result<(), BackendError> {
            self.next().map(|_| ())
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

    fn unavailable() -> Result<String, BackendError> {
        Err(BackendError::api(503, "ServiceUnavailable", "try again later"))
    }

    #[tokio::test]
    async fn test_retries_transient_status_then_succeeds() {
        let flaky = FlakyConnection::new(vec![
            unavailable(),
            unavailable(),
            Ok("queued".to_string()),
        ]);
        let conn = ResilientConnection::wrap(flaky.clone(), RetryConfig::immediate(5));

        let status = conn.job_status("j-1").await.unwrap();
        assert_eq!(status, "queued");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let flaky = FlakyConnection::new((0..10).map(|_| unavailable()).collect());
        let conn = ResilientConnection::wrap(flaky.clone(), RetryConfig::immediate(2));

        let err = conn.job_status("j-1").await.unwrap_err();
        match err {
            BackendError::RetriesExhausted {
                method,
                status,
                attempts,
                ..
            } => {
                assert_eq!(method, HttpMethod::Get);
                assert_eq!(status, 503);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let flaky = FlakyConnection::new(vec![Err(BackendError::api(
            404,
            "JobNotFound",
            "no such job",
        ))]);
        let conn = ResilientConnection::wrap(flaky.clone(), RetryConfig::immediate(5));

        let err = conn.job_status("j-1").await.unwrap_err();
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_is_not_retried() {
        let flaky = FlakyConnection::new(vec![unavailable(), Ok(String::new())]);
        let conn = ResilientConnection::wrap(flaky.clone(), RetryConfig::immediate(5));

        let err = conn.stop_job("j-1").await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_errors_pass_through() {
        let flaky = FlakyConnection::new(vec![Err(BackendError::connection("reset"))]);
        let conn = ResilientConnection::wrap(flaky.clone(), RetryConfig::immediate(5));

        assert!(conn.job_status("j-1").await.unwrap_err().is_connection());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyConnector(Arc<FlakyConnection>);

    impl Connector for FlakyConnector {
        fn connect(
            &self,
            _root_url: &str,
            _access_token: Option<&str>,
        ) -> Result<Arc<dyn BackendConnection>, BackendError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_connector_wraps_new_connections() {
        let flaky = FlakyConnection::new(vec![unavailable(), Ok("queued".to_string())]);
        let connector = ResilientConnector::new(
            Arc::new(FlakyConnector(flaky.clone())),
            RetryConfig::immediate(5),
        );

        let conn = connector.connect("https://flaky.test", None).unwrap();
        assert!(conn.is_resilient());
        assert_eq!(conn.job_status("j-1").await.unwrap(), "queued");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let wrapped = ResilientConnection::wrap(flaky, RetryConfig::default());
        let err = wrapped
            .connector()
            .connect("https://flaky.test", None)
            .err()
            .expect("test connector refuses connections");
        assert!(err.is_connection());
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let flaky = FlakyConnection::new(Vec::new());
        let once = ResilientConnection::wrap(flaky, RetryConfig::default());
        let twice = ResilientConnection::wrap(once.clone(), RetryConfig::default());
        assert!(Arc::ptr_eq(&once, &twice));
    }
}
