//! agent-runner: sandboxed execution of third-party coding agents.
//!
//! Given a base repository and a problem statement, the runner copies the
//! repository into an isolated workspace, runs an agent against it under a
//! wall-clock budget, and returns the unified diff of what the agent changed
//! together with its logs and a terminal status.

pub mod cli;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod runner;

pub use error::{CollectionError, FailureKind, RunnerError, SandboxError, WorkspaceError};
pub use runner::{RunConfig, RunOrchestrator, RunResult, RunStatus, Task};
