//! Error types for agent-runner operations.
//!
//! Defines the error taxonomy for each stage of a run:
//! - Workspace preparation (setup failures, non-retryable)
//! - Sandbox launch and supervision
//! - Result collection (diff and log extraction)
//! - Runner configuration and task loading
//!
//! Timeouts and agent crashes are *outcomes*, not errors: they are reported
//! through [`crate::runner::RunStatus`] rather than through these types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while materializing a task workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Source repository not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Destination '{0}' already exists and is not empty")]
    DestinationNotEmpty(PathBuf),

    #[error("Failed to copy '{path}': {reason}")]
    CopyFailed { path: PathBuf, reason: String },

    #[error("Archive entry escapes the workspace: {0}")]
    UnsafeArchiveEntry(String),

    #[error("Invalid run id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidRunId(String),

    #[error("Task has no agent entry point and no default is configured")]
    MissingAgent,

    #[error("Failed to snapshot baseline: {0}")]
    Baseline(#[from] git2::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while launching or supervising a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to launch sandbox: {0}")]
    Launch(String),

    #[error("Failed to wait for sandbox '{id}': {reason}")]
    Wait { id: String, reason: String },

    #[error("Failed to tear down sandbox '{id}': {reason}")]
    Teardown { id: String, reason: String },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while extracting the patch and logs of a finished run.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Baseline snapshot unavailable at '{path}': {source}")]
    BaselineUnavailable {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to compute workspace diff: {0}")]
    Diff(#[from] git2::Error),

    #[error("Failed to read workspace: {0}")]
    Workdir(#[from] WorkspaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by configuration and task loading, before a run starts.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid task file '{path}': {reason}")]
    InvalidTask { path: PathBuf, reason: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which pipeline stage produced a terminal `Failed` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Workspace preparation failed; fix the environment and resubmit.
    Workspace,
    /// The sandbox could not be launched or supervised.
    Sandbox,
    /// Patch or log extraction failed after execution; workspace preserved.
    Collection,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Workspace => write!(f, "workspace"),
            FailureKind::Sandbox => write!(f, "sandbox"),
            FailureKind::Collection => write!(f, "collection"),
        }
    }
}

impl From<&WorkspaceError> for FailureKind {
    fn from(_: &WorkspaceError) -> Self {
        FailureKind::Workspace
    }
}

impl From<&SandboxError> for FailureKind {
    fn from(_: &SandboxError) -> Self {
        FailureKind::Sandbox
    }
}

impl From<&CollectionError> for FailureKind {
    fn from(_: &CollectionError) -> Self {
        FailureKind::Collection
    }
}
