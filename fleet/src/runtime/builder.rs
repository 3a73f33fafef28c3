use std::fmt;
use std::sync::Arc;

use crate::backend::{BackendRegistry, BackendSpec};
use crate::config::OrchestratorConfig;
use crate::error::ConfigError;

use super::lifecycle::{ArtifactLifecycle, JobLifecycle, NoopLifecycle};
use super::supervisor::{JobStarter, Orchestrator};

/// Builder for constructing an [`Orchestrator`].
///
/// A [`JobStarter`] is required. Backends can be registered here or later
/// through [`Orchestrator::add_backend`]. Without an explicit lifecycle,
/// an [`ArtifactLifecycle`] is used when `root_dir` is configured.
///
/// # Example
///
/// ```ignore
/// use fleet::runtime::{CreateJobStarter, OrchestratorBuilder};
/// use fleet::backend::BackendSpec;
///
/// let orchestrator = OrchestratorBuilder::new()
///     .with_config(config)
///     .with_backend(BackendSpec::new("foo", connection).with_parallel_jobs(2))
///     .with_starter(Arc::new(CreateJobStarter::new(|row, _backend| Some(payload(row)))))
///     .build()?;
/// let stats = orchestrator.run(source).await?;
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    backends: Vec<BackendSpec>,
    starter: Option<Arc<dyn JobStarter>>,
    lifecycle: Option<Arc<dyn JobLifecycle>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("backends", &self.backends.iter().map(|b| b.name.as_str()).collect::<Vec<_>>())
            .field("starter_set", &self.starter.is_some())
            .field("lifecycle_set", &self.lifecycle.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the control loop configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a backend.
    pub fn with_backend(mut self, spec: BackendSpec) -> Self {
        self.backends.push(spec);
        self
    }

    /// Set the hook that creates remote jobs.
    pub fn with_starter(mut self, starter: Arc<dyn JobStarter>) -> Self {
        self.starter = Some(starter);
        self
    }

    /// Set the hooks fired when jobs finish, fail or get canceled.
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn JobLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if no starter is set or a backend name is invalid or
    /// registered twice.
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let starter = self.starter.ok_or(ConfigError::MissingStarter)?;

        let registry = BackendRegistry::new(self.config.retry.clone());
        for spec in self.backends {
            registry.add_backend(spec)?;
        }

        let lifecycle = match (self.lifecycle, &self.config.root_dir) {
            (Some(lifecycle), _) => lifecycle,
            (None, Some(root_dir)) => Arc::new(
                ArtifactLifecycle::new(root_dir.clone())
                    .with_download_results(self.config.download_results),
            ),
            (None, None) => Arc::new(NoopLifecycle),
        };

        Ok(Orchestrator::new(self.config, registry, starter, lifecycle))
    }
}
