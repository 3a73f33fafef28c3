use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{BackendConnection, LogLevel};
use crate::job::JobRecord;

/// Hooks fired on the control loop when a job reaches a terminal state.
///
/// Errors are logged and counted; they never stop the run.
#[async_trait]
pub trait JobLifecycle: Send + Sync {
    async fn on_job_done(
        &self,
        _record: &JobRecord,
        _connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_job_error(
        &self,
        _record: &JobRecord,
        _connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_job_cancel(
        &self,
        _record: &JobRecord,
        _connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lifecycle that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLifecycle;

impl JobLifecycle for NoopLifecycle {}

/// Lifecycle that stores job artifacts under `root_dir/job_<id>/`.
///
/// - done: downloads the results (unless disabled) and writes the job
///   description to `job_<id>.json`
/// - error: writes the error-level logs to `job_<id>_errors.json`
/// - cancel: logs only
#[derive(Clone, Debug)]
pub struct ArtifactLifecycle {
    root_dir: PathBuf,
    download_results: bool,
}

impl ArtifactLifecycle {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            download_results: true,
        }
    }

    pub fn with_download_results(mut self, download: bool) -> Self {
        self.download_results = download;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root_dir.join(format!("job_{}", file_safe(job_id)))
    }

    pub fn error_log_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("job_{}_errors.json", file_safe(job_id)))
    }

    pub fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("job_{}.json", file_safe(job_id)))
    }

    async fn ensure_job_dir(&self, job_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[async_trait]
impl JobLifecycle for ArtifactLifecycle {
    async fn on_job_done(
        &self,
        record: &JobRecord,
        connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        let Some(job_id) = record.id.as_deref() else {
            return Ok(());
        };
        let dir = self.ensure_job_dir(job_id).await?;

        if self.download_results {
            let files = connection.download_results(job_id, &dir).await?;
            tracing::info!(job_id, files = files.len(), dir = %dir.display(), "downloaded job results");
        }

        let description = connection.describe_job(job_id).await?;
        tokio::fs::write(
            self.metadata_path(job_id),
            serde_json::to_vec_pretty(&description)?,
        )
        .await?;
        Ok(())
    }

    async fn on_job_error(
        &self,
        record: &JobRecord,
        connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        let Some(job_id) = record.id.as_deref() else {
            return Ok(());
        };
        let logs = connection.job_logs(job_id, LogLevel::Error).await?;
        self.ensure_job_dir(job_id).await?;
        let path = self.error_log_path(job_id);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&logs)?).await?;
        tracing::warn!(job_id, entries = logs.len(), path = %path.display(), "job failed, error logs saved");
        Ok(())
    }

    async fn on_job_cancel(
        &self,
        record: &JobRecord,
        _connection: Arc<dyn BackendConnection>,
    ) -> anyhow::Result<()> {
        tracing::info!(job_id = record.id.as_deref().unwrap_or(""), row = %record.row, "job canceled");
        Ok(())
    }
}

/// Backend job ids end up in file names; anything outside
/// `[A-Za-z0-9._-]` is replaced so an id can never leave `root_dir`.
fn file_safe(job_id: &str) -> String {
    job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_paths() {
        let lifecycle = ArtifactLifecycle::new("/data/run");
        assert_eq!(lifecycle.job_dir("j-1"), PathBuf::from("/data/run/job_j-1"));
        assert_eq!(
            lifecycle.metadata_path("j-1"),
            PathBuf::from("/data/run/job_j-1/job_j-1.json")
        );
        assert_eq!(
            lifecycle.error_log_path("j-1"),
            PathBuf::from("/data/run/job_j-1/job_j-1_errors.json")
        );
    }

    #[test]
    fn test_job_ids_cannot_escape_root_dir() {
        let lifecycle = ArtifactLifecycle::new("/data/run");
        for job_id in ["../x", "a/../../etc", "..\\x", "/abs"] {
            let dir = lifecycle.job_dir(job_id);
            assert_eq!(dir.parent(), Some(Path::new("/data/run")), "{job_id}");
            assert_eq!(lifecycle.metadata_path(job_id).parent(), Some(dir.as_path()));
            assert_eq!(lifecycle.error_log_path(job_id).parent(), Some(dir.as_path()));
        }
        assert_eq!(lifecycle.job_dir("../x"), PathBuf::from("/data/run/job_.._x"));
    }

    #[tokio::test]
    async fn test_artifacts_stay_under_root_dir() {
        let root = tempfile::tempdir().unwrap();
        let lifecycle = ArtifactLifecycle::new(root.path().join("run"));
        let dir = lifecycle.ensure_job_dir("../escaped").await.unwrap();
        assert!(dir.starts_with(root.path().join("run")));
        assert!(!root.path().join("escaped").exists());
    }
}
