//! Agent runs: one task, one sandbox, one patch.
//!
//! This module takes a task (a base repository plus a problem statement),
//! runs an untrusted agent against an isolated copy of the repository, and
//! reports what the agent changed.
//!
//! # Architecture
//!
//! ```text
//! Task → WorkspacePreparer → SandboxExecutor → ResultCollector → RunResult
//!          (copy + baseline)   (launch, wait,     (diff, logs,
//!                               tear down)         status)
//! ```
//!
//! [`RunOrchestrator`] drives the pipeline and guarantees the sandbox is torn
//! down whatever the outcome: completion, crash, timeout or cancellation.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use agent_runner::execution::DockerBackend;
//! use agent_runner::runner::{AgentEntry, RunConfig, RunOrchestrator, Task};
//!
//! let config = RunConfig::new("http://localhost:8001")
//!     .with_timeout(Duration::from_secs(1800))
//!     .with_default_agent(AgentEntry::agent_main("./agent.py"));
//!
//! let backend = Arc::new(DockerBackend::connect().await?);
//! let orchestrator = RunOrchestrator::new(config, backend);
//!
//! let result = orchestrator
//!     .submit(Task::new("./repos/calculator", "Fix add()"))
//!     .await;
//! println!("{}", result.summary());
//! ```

pub mod collector;
pub mod config;
pub mod harness;
pub mod logs;
pub mod orchestrator;
pub mod result;
pub mod sandbox;
pub mod task;
pub mod workspace;

pub use collector::{CollectedRun, ResultCollector, WorkspaceDiff};
pub use config::{RunConfig, DEFAULT_IMAGE};
pub use logs::{LogLine, Severity, Stream};
pub use orchestrator::RunOrchestrator;
pub use result::{PhaseRecord, RunFailure, RunPhase, RunResult, RunStatus};
pub use sandbox::{
    CapturedOutput, ExecutionOutcome, LaunchSpec, NetworkPolicy, OutcomeKind, SandboxBackend,
    SandboxExecutor, SandboxHandle, VolumeMount,
};
pub use task::{AgentEntry, Task};
pub use workspace::{Workspace, WorkspacePreparer};
