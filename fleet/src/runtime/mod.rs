/// Builder for constructing orchestrator instances.
pub mod builder;
/// Hooks fired when jobs reach a terminal state.
pub mod lifecycle;
/// Control loop driving ledger rows through their lifecycle.
pub mod supervisor;
/// Worker pool executing job start calls off the control loop.
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use lifecycle::{ArtifactLifecycle, JobLifecycle, NoopLifecycle};
pub use supervisor::{CreateJobStarter, JobRun, JobStarter, Orchestrator, ShutdownToken};
pub use worker::{Drained, StartJobTask, Task, TaskResult, WorkerPool};
