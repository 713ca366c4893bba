//! Results of agent runs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::logs::LogLine;
use crate::error::FailureKind;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Agent exited cleanly and changed the repository.
    Succeeded,
    /// Agent exited cleanly without changing anything.
    EmptyPatch,
    /// Agent exceeded its time budget.
    Timeout,
    /// Agent exited with a non-zero status.
    Crashed,
    /// Run was cancelled by the caller.
    Cancelled,
    /// The runner itself failed; see `RunResult::failure`.
    Failed,
}

impl RunStatus {
    /// True when the agent completed and produced a patch.
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    /// Label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::EmptyPatch => "empty_patch",
            RunStatus::Timeout => "timeout",
            RunStatus::Crashed => "crashed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Preparing,
    Executing,
    Collecting,
    Done,
    Failed,
}

impl RunPhase {
    /// Returns true if `next` may follow `self`.
    ///
    /// Phases advance strictly in order; `Failed` is reachable from any
    /// non-terminal phase. A run cancelled while still queued goes straight
    /// from `Pending` to `Done`.
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Pending, Preparing | Done)
                | (Preparing, Executing)
                | (Executing, Collecting)
                | (Collecting, Done)
                | (Pending | Preparing | Executing | Collecting, Failed)
        )
    }

    /// Returns true for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    /// Label used in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Preparing => "preparing",
            RunPhase::Executing => "executing",
            RunPhase::Collecting => "collecting",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }
}

/// When a run entered a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: RunPhase,
    pub entered_at: DateTime<Utc>,
}

/// Why the runner failed a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Complete result of running an agent against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Task identifier.
    pub task_id: String,
    /// Status of the run.
    pub status: RunStatus,
    /// Unified diff against the initial repository; empty if nothing changed.
    pub patch: String,
    /// Paths touched by the patch, in patch order.
    pub changed_files: Vec<String>,
    /// Parsed agent output, stdout first.
    pub logs: Vec<LogLine>,
    /// Raw stderr, kept for crash diagnosis.
    pub stderr: String,
    /// Exit code when the agent exited on its own.
    pub exit_code: Option<i64>,
    /// Structured output reported by the agent, if any.
    pub agent_output: Option<serde_json::Value>,
    /// Time spent inside the sandbox.
    pub elapsed: Duration,
    /// Sandbox backend used.
    pub backend: String,
    /// Identifier of the sandbox, if one was launched.
    pub sandbox_id: Option<String>,
    /// Run directory on the host.
    pub run_dir: PathBuf,
    /// Phase history, in order.
    pub phases: Vec<PhaseRecord>,
    /// Set when `status` is `Failed`.
    pub failure: Option<RunFailure>,
    /// Timestamp when the run was submitted.
    pub started_at: DateTime<Utc>,
    /// Timestamp when the run finished.
    pub completed_at: DateTime<Utc>,
}

impl RunResult {
    /// Creates an empty result for `task_id`; fields are filled in as the
    /// run progresses.
    pub fn new(task_id: impl Into<String>, backend: impl Into<String>, run_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: RunStatus::Failed,
            patch: String::new(),
            changed_files: Vec::new(),
            logs: Vec::new(),
            stderr: String::new(),
            exit_code: None,
            agent_output: None,
            elapsed: Duration::ZERO,
            backend: backend.into(),
            sandbox_id: None,
            run_dir,
            phases: vec![PhaseRecord {
                phase: RunPhase::Pending,
                entered_at: now,
            }],
            failure: None,
            started_at: now,
            completed_at: now,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.phases
            .last()
            .map(|p| p.phase)
            .unwrap_or(RunPhase::Pending)
    }

    /// Moves to `next`, recording the transition. Invalid transitions are
    /// ignored and reported as `false`.
    pub fn advance(&mut self, next: RunPhase) -> bool {
        let current = self.phase();
        if !current.can_advance_to(next) {
            tracing::error!(
                task_id = %self.task_id,
                from = current.as_str(),
                to = next.as_str(),
                "Invalid run phase transition"
            );
            return false;
        }
        self.phases.push(PhaseRecord {
            phase: next,
            entered_at: Utc::now(),
        });
        true
    }

    /// Marks the run failed.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.advance(RunPhase::Failed);
        self.status = RunStatus::Failed;
        self.failure = Some(RunFailure {
            kind,
            message: message.into(),
        });
        self.completed_at = Utc::now();
    }

    /// Marks the run done with `status`.
    pub fn finish(&mut self, status: RunStatus) {
        self.advance(RunPhase::Done);
        self.status = status;
        self.completed_at = Utc::now();
    }

    /// Wall-clock time from submission to completion.
    pub fn total_duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Returns a short summary of the run.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "Task {}: {} in {:.1}s",
            self.task_id,
            self.status,
            self.elapsed.as_secs_f64()
        );
        if !self.changed_files.is_empty() {
            s.push_str(&format!(", {} file(s) changed", self.changed_files.len()));
        }
        if let Some(code) = self.exit_code {
            s.push_str(&format!(", exit code {code}"));
        }
        if let Some(failure) = &self.failure {
            s.push_str(&format!(" ({}: {})", failure.kind, failure.message));
        }
        s
    }

    /// Writes the result as pretty JSON.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(task_id = %self.task_id, path = %path.display(), "Result written");
        Ok(())
    }
}
