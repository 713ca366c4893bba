//! Result collection: patch, logs and status of a finished execution.

use std::fs;
use std::path::Path;

use git2::{DiffFormat, DiffOptions, Repository};
use serde_json::Value;
use tracing::{debug, warn};

use super::harness::OUTPUT_FILE;
use super::logs::{parse_streams, LogLine};
use super::result::RunStatus;
use super::sandbox::{ExecutionOutcome, OutcomeKind};
use super::workspace::{snapshot_tree, Workspace};
use crate::error::CollectionError;

/// Changes between the baseline snapshot and the final workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceDiff {
    /// Git-style unified diff with `a/` and `b/` prefixes.
    pub patch: String,
    /// Paths touched by the patch, in patch order.
    pub changed_files: Vec<String>,
}

impl WorkspaceDiff {
    /// True if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }
}

/// Everything extracted from one finished execution.
#[derive(Debug, Clone)]
pub struct CollectedRun {
    pub status: RunStatus,
    pub diff: WorkspaceDiff,
    pub logs: Vec<LogLine>,
    pub agent_output: Option<Value>,
}

/// Turns an execution outcome and its workspace into a result.
#[derive(Debug, Clone, Default)]
pub struct ResultCollector;

impl ResultCollector {
    /// Creates a new collector.
    pub fn new() -> Self {
        Self
    }

    /// Computes the patch, parses the logs and classifies the outcome.
    ///
    /// The patch is computed for every outcome so partial work from
    /// timed-out, crashed or cancelled agents is still reported.
    pub fn collect(
        &self,
        workspace: &Workspace,
        outcome: &ExecutionOutcome,
    ) -> Result<CollectedRun, CollectionError> {
        let diff = compute_diff(&workspace.baseline_dir(), &workspace.repo_dir())?;
        let logs = parse_streams(&outcome.stdout, &outcome.stderr);
        let agent_output = read_agent_output(&workspace.output_dir(), &outcome.stdout);
        let status = classify(outcome.kind, diff.is_empty());

        debug!(
            status = %status,
            files = diff.changed_files.len(),
            patch_bytes = diff.patch.len(),
            log_lines = logs.len(),
            "Collected run"
        );

        Ok(CollectedRun {
            status,
            diff,
            logs,
            agent_output,
        })
    }
}

/// Maps an execution outcome and patch emptiness to a run status.
pub fn classify(kind: OutcomeKind, patch_empty: bool) -> RunStatus {
    match kind {
        OutcomeKind::Completed if patch_empty => RunStatus::EmptyPatch,
        OutcomeKind::Completed => RunStatus::Succeeded,
        OutcomeKind::Timeout => RunStatus::Timeout,
        OutcomeKind::Crashed => RunStatus::Crashed,
        OutcomeKind::Cancelled => RunStatus::Cancelled,
    }
}

/// Diffs the baseline commit of the bare repository at `baseline` against
/// the files currently in `worktree`, including new files.
///
/// The worktree is read with the same walk that recorded the baseline, so
/// files inside nested checkouts compare like any other file.
pub fn compute_diff(baseline: &Path, worktree: &Path) -> Result<WorkspaceDiff, CollectionError> {
    let repo = Repository::open_bare(baseline).map_err(|source| {
        CollectionError::BaselineUnavailable {
            path: baseline.to_path_buf(),
            source,
        }
    })?;
    repo.set_workdir(worktree, false)?;

    let old_tree = repo.head()?.peel_to_tree()?;
    let (new_tree, _) = snapshot_tree(&repo, worktree)?;
    let new_tree = repo.find_tree(new_tree)?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

    let changed_files = diff
        .deltas()
        .filter_map(|delta| {
            delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();

    let mut patch = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            patch.push(line.origin() as u8);
        }
        patch.extend_from_slice(line.content());
        true
    })?;

    Ok(WorkspaceDiff {
        patch: String::from_utf8_lossy(&patch).into_owned(),
        changed_files,
    })
}

/// Reads the agent's structured output: `output.json` if present and valid,
/// otherwise the last stdout line that is a JSON object.
pub fn read_agent_output(output_dir: &Path, stdout: &str) -> Option<Value> {
    let path = output_dir.join(OUTPUT_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<Value>(&content) {
            Ok(value) => return Some(value),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring malformed agent output"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to read agent output"),
    }

    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if line.starts_with('{') && line.ends_with('}') {
            serde_json::from_str::<Value>(line)
                .ok()
                .filter(Value::is_object)
        } else {
            None
        }
    })
}
