//! Run orchestration: one task through prepare, execute and collect.
//!
//! ```text
//! Pending → Preparing → Executing → Collecting → Done
//!     ╰──────────┴───────────┴───────────┴──→ Failed
//! ```
//!
//! Every error from the pipeline stages is turned into a `Failed` result
//! here; `submit` itself never fails.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::collector::ResultCollector;
use super::config::RunConfig;
use super::result::{RunPhase, RunResult, RunStatus};
use super::sandbox::{SandboxBackend, SandboxExecutor};
use super::task::{AgentEntry, Task};
use super::workspace::{Workspace, WorkspacePreparer};
use crate::error::{FailureKind, WorkspaceError};
use crate::metrics::MetricsCollector;

type Registry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Drives tasks through the run pipeline, one at a time.
pub struct RunOrchestrator {
    config: RunConfig,
    preparer: WorkspacePreparer,
    executor: SandboxExecutor,
    collector: ResultCollector,
    metrics: MetricsCollector,
    /// Serializes runs on this instance.
    pipeline: tokio::sync::Mutex<()>,
    active: Registry,
    shutdown: CancellationToken,
}

impl RunOrchestrator {
    /// Creates an orchestrator running agents on `backend`.
    pub fn new(config: RunConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            config,
            preparer: WorkspacePreparer::new(),
            executor: SandboxExecutor::new(backend),
            collector: ResultCollector::new(),
            metrics: MetricsCollector::new(),
            pipeline: tokio::sync::Mutex::new(()),
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the configuration shared by all runs.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs `task` to completion.
    pub async fn submit(&self, task: Task) -> RunResult {
        self.submit_with_cancel(task, CancellationToken::new()).await
    }

    /// Runs `task`, stopping early when `cancel` fires.
    pub async fn submit_with_cancel(&self, task: Task, cancel: CancellationToken) -> RunResult {
        let config = self.config.for_task(&task);
        let mut result = RunResult::new(
            task.id.clone(),
            self.executor.backend_name(),
            config.run_dir(&task.id),
        );

        let token = cancel.child_token();
        let _registration = match ActiveRun::register(&self.active, &task.id, token.clone()) {
            Some(registration) => registration,
            None => {
                result.fail(
                    FailureKind::Workspace,
                    WorkspaceError::DestinationNotEmpty(result.run_dir.clone()).to_string(),
                );
                return self.finish(result);
            }
        };
        if self.shutdown.is_cancelled() {
            token.cancel();
        }

        let _serialized = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(task_id = %task.id, "Run cancelled while queued");
                result.finish(RunStatus::Cancelled);
                return self.finish(result);
            }
            guard = self.pipeline.lock() => guard,
        };
        info!(task_id = %task.id, backend = self.executor.backend_name(), "Run started");

        self.run_pipeline(&task, &config, &token, &mut result).await;
        self.finish(result)
    }

    /// Cancels the run of `task_id`. Returns false if no such run is active.
    pub fn cancel(&self, task_id: &str) -> bool {
        let active = lock_registry(&self.active);
        match active.get(task_id) {
            Some(token) => {
                info!(task_id = %task_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs that are queued or in flight.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_registry(&self.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancels every active run and any run submitted afterwards.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let active = lock_registry(&self.active);
        if !active.is_empty() {
            warn!(runs = active.len(), "Shutting down; cancelling active runs");
        }
        for token in active.values() {
            token.cancel();
        }
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        config: &RunConfig,
        cancel: &CancellationToken,
        result: &mut RunResult,
    ) {
        if cancel.is_cancelled() {
            info!(task_id = %task.id, "Run cancelled before preparation");
            result.finish(RunStatus::Cancelled);
            return;
        }

        // Preparing
        result.advance(RunPhase::Preparing);
        let started = Instant::now();
        let (workspace, agent) = match self.prepare(task, config).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Workspace preparation failed");
                result.fail(FailureKind::from(&e), e.to_string());
                return;
            }
        };
        result.run_dir = workspace.root().to_path_buf();
        self.metrics
            .record_phase(RunPhase::Preparing.as_str(), started.elapsed().as_secs_f64());

        // Executing
        result.advance(RunPhase::Executing);
        let started = Instant::now();
        let outcome = match self
            .executor
            .execute(&task.id, &workspace, &agent, config, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Sandbox execution failed");
                remove_workspace(&workspace);
                result.fail(FailureKind::from(&e), e.to_string());
                return;
            }
        };
        result.elapsed = outcome.elapsed;
        result.exit_code = outcome.exit_code;
        result.stderr = outcome.stderr.clone();
        result.sandbox_id = outcome.sandbox_id.clone();
        self.metrics
            .record_phase(RunPhase::Executing.as_str(), started.elapsed().as_secs_f64());

        // Collecting
        result.advance(RunPhase::Collecting);
        let started = Instant::now();
        let collector = self.collector.clone();
        let ws = workspace.clone();
        let collected = tokio::task::spawn_blocking(move || collector.collect(&ws, &outcome)).await;
        let collected = match collected {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                error!(
                    task_id = %task.id,
                    error = %e,
                    workspace = %workspace.root().display(),
                    "Result collection failed; workspace preserved"
                );
                result.fail(FailureKind::from(&e), e.to_string());
                persist(result, &workspace);
                return;
            }
            Err(join) => {
                result.fail(FailureKind::Collection, format!("collector task failed: {join}"));
                persist(result, &workspace);
                return;
            }
        };
        self.metrics
            .record_phase(RunPhase::Collecting.as_str(), started.elapsed().as_secs_f64());
        self.metrics.record_patch(collected.diff.patch.len());

        result.patch = collected.diff.patch;
        result.changed_files = collected.diff.changed_files;
        result.logs = collected.logs;
        result.agent_output = collected.agent_output;
        result.finish(collected.status);

        persist(result, &workspace);
        if !config.keep_workspaces {
            if let Err(e) = workspace.discard_sandbox_dirs() {
                warn!(task_id = %task.id, error = %e, "Failed to discard sandbox directories");
            }
        }
    }

    /// Materializes the workspace and stages the agent inputs.
    async fn prepare(
        &self,
        task: &Task,
        config: &RunConfig,
    ) -> Result<(Workspace, AgentEntry), WorkspaceError> {
        if !task.has_valid_id() {
            return Err(WorkspaceError::InvalidRunId(task.id.clone()));
        }
        let agent = config
            .default_agent
            .clone()
            .ok_or(WorkspaceError::MissingAgent)?;

        let preparer = self.preparer.clone();
        let runs_dir = config.runs_dir.clone();
        let source = task.repo.clone();
        let task_id = task.id.clone();
        let problem = task.problem_statement.clone();
        let staged_agent = agent.clone();

        let workspace = tokio::task::spawn_blocking(move || {
            let run_dir = absolute_run_dir(&runs_dir, &task_id)?;
            let workspace = preparer.prepare(&source, &run_dir)?;
            if let Err(e) = workspace.stage_input(&problem, &staged_agent) {
                remove_workspace(&workspace);
                return Err(e);
            }
            Ok(workspace)
        })
        .await
        .map_err(|e| WorkspaceError::Io(std::io::Error::other(e.to_string())))??;

        Ok((workspace, agent))
    }

    fn finish(&self, result: RunResult) -> RunResult {
        self.metrics.record_run(
            result.status.as_str(),
            &result.backend,
            result.total_duration().as_secs_f64(),
        );
        info!(
            task_id = %result.task_id,
            status = %result.status,
            elapsed_ms = result.elapsed.as_millis() as u64,
            changed_files = result.changed_files.len(),
            "Run finished"
        );
        result
    }
}

/// Registry entry removed when the run ends, however it ends.
struct ActiveRun {
    registry: Registry,
    task_id: String,
}

impl ActiveRun {
    fn register(registry: &Registry, task_id: &str, token: CancellationToken) -> Option<Self> {
        let mut active = lock_registry(registry);
        if active.contains_key(task_id) {
            return None;
        }
        active.insert(task_id.to_string(), token);
        Some(Self {
            registry: registry.clone(),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock_registry(&self.registry).remove(&self.task_id);
    }
}

fn lock_registry(
    registry: &Mutex<HashMap<String, CancellationToken>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    // A panic while holding the lock cannot leave the map inconsistent.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Docker bind mounts need absolute host paths.
fn absolute_run_dir(runs_dir: &Path, task_id: &str) -> Result<PathBuf, WorkspaceError> {
    fs::create_dir_all(runs_dir)?;
    Ok(runs_dir.canonicalize()?.join(task_id))
}

fn remove_workspace(workspace: &Workspace) {
    if let Err(e) = workspace.remove() {
        warn!(workspace = %workspace.root().display(), error = %e, "Failed to remove run directory");
    }
}

fn persist(result: &RunResult, workspace: &Workspace) {
    if let Err(e) = result.save(&workspace.result_path()) {
        warn!(task_id = %result.task_id, error = %e, "Failed to write result.json");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::runner::sandbox::{CapturedOutput, LaunchSpec, SandboxHandle, VolumeMount};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend that writes a file into the workspace and exits 0, or fails to launch.
    struct FakeBackend {
        fail_launch: bool,
    }

    struct FakeHandle;

    #[async_trait]
    impl SandboxBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn visible_path(&self, mount: &VolumeMount) -> PathBuf {
            mount.host_path.clone()
        }

        async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            if self.fail_launch {
                return Err(SandboxError::Launch("no such image".to_string()));
            }
            fs::write(spec.workspace.host_path.join("fixed.txt"), "ok\n")?;
            Ok(Box::new(FakeHandle))
        }
    }

    #[async_trait]
    impl SandboxHandle for FakeHandle {
        fn id(&self) -> &str {
            "fake-1"
        }
        async fn wait(&mut self) -> Result<i64, SandboxError> {
            Ok(0)
        }
        async fn kill(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn output(&mut self) -> Result<CapturedOutput, SandboxError> {
            Ok(CapturedOutput {
                stdout: "[INFO] fixed\n".to_string(),
                stderr: String::new(),
            })
        }
        async fn release(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn setup(fail_launch: bool) -> (tempfile::TempDir, RunOrchestrator, Task) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("README"), "hello\n").unwrap();

        let config = RunConfig::default()
            .with_runs_dir(tmp.path().join("runs"))
            .with_timeout(Duration::from_secs(5))
            .with_default_agent(AgentEntry::command("fake", vec![]));
        let orchestrator = RunOrchestrator::new(config, Arc::new(FakeBackend { fail_launch }));
        let task = Task::new(&repo, "write fixed.txt").with_id("task-1");
        (tmp, orchestrator, task)
    }

    #[tokio::test]
    async fn test_successful_run_persists_result() {
        let (tmp, orchestrator, task) = setup(false);
        let result = orchestrator.submit(task).await;

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.changed_files, vec!["fixed.txt"]);
        assert_eq!(result.phase(), RunPhase::Done);
        let run_dir = tmp.path().join("runs/task-1");
        assert!(run_dir.join("result.json").is_file());
        assert!(!run_dir.join("repo").exists());
        assert!(orchestrator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_removes_run_dir() {
        let (tmp, orchestrator, task) = setup(true);
        let result = orchestrator.submit(task).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, FailureKind::Sandbox);
        assert!(!tmp.path().join("runs/task-1").exists());
    }

    #[tokio::test]
    async fn test_missing_agent_fails_preparation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RunConfig::default().with_runs_dir(tmp.path().join("runs"));
        let orchestrator = RunOrchestrator::new(config, Arc::new(FakeBackend { fail_launch: false }));
        let result = orchestrator.submit(Task::new(tmp.path(), "p")).await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Workspace);
        assert!(failure.message.contains("no agent entry point"));
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let (_tmp, orchestrator, task) = setup(false);
        let result = orchestrator.submit(task.with_id("../escape")).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.failure.unwrap().message.contains("Invalid run id"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_run() {
        let (_tmp, orchestrator, _task) = setup(false);
        assert!(!orchestrator.cancel("nope"));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_cancelled() {
        let (tmp, orchestrator, task) = setup(false);
        orchestrator.shutdown();
        let result = orchestrator.submit(task).await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.phase(), RunPhase::Done);
        assert!(!tmp.path().join("runs/task-1").exists());
    }

    /// Backend whose agent runs until killed; signals once launched.
    struct ParkedBackend {
        launched: Arc<tokio::sync::Notify>,
    }

    struct ParkedHandle;

    #[async_trait]
    impl SandboxBackend for ParkedBackend {
        fn name(&self) -> &'static str {
            "parked"
        }

        fn visible_path(&self, mount: &VolumeMount) -> PathBuf {
            mount.host_path.clone()
        }

        async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            self.launched.notify_one();
            Ok(Box::new(ParkedHandle))
        }
    }

    #[async_trait]
    impl SandboxHandle for ParkedHandle {
        fn id(&self) -> &str {
            "parked-1"
        }
        async fn wait(&mut self) -> Result<i64, SandboxError> {
            std::future::pending().await
        }
        async fn kill(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn output(&mut self) -> Result<CapturedOutput, SandboxError> {
            Ok(CapturedOutput::default())
        }
        async fn release(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    /// Backend whose launch never finishes.
    struct StalledBackend;

    #[async_trait]
    impl SandboxBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn visible_path(&self, mount: &VolumeMount) -> PathBuf {
            mount.host_path.clone()
        }

        async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
            std::future::pending().await
        }
    }

    fn stalled(tmp: &Path, launch_timeout: Duration) -> (RunOrchestrator, Task) {
        let repo = tmp.join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("README"), "hello\n").unwrap();
        let config = RunConfig::default()
            .with_runs_dir(tmp.join("runs"))
            .with_timeout(Duration::from_secs(1))
            .with_launch_timeout(launch_timeout)
            .with_default_agent(AgentEntry::command("stalled", vec![]));
        let orchestrator = RunOrchestrator::new(config, Arc::new(StalledBackend));
        (orchestrator, Task::new(&repo, "p").with_id("task-1"))
    }

    #[tokio::test]
    async fn test_stalled_launch_fails_within_launch_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, task) = stalled(tmp.path(), Duration::from_secs(1));

        let started = Instant::now();
        let result = orchestrator.submit(task).await;
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, FailureKind::Sandbox);
        assert!(!tmp.path().join("runs/task-1").exists());
    }

    #[tokio::test]
    async fn test_cancel_during_stalled_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let (orchestrator, task) = stalled(tmp.path(), Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = orchestrator.submit_with_cancel(task, cancel).await;
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.sandbox_id.is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_skips_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("README"), "hello\n").unwrap();
        let launched = Arc::new(tokio::sync::Notify::new());
        let config = RunConfig::default()
            .with_runs_dir(tmp.path().join("runs"))
            .with_timeout(Duration::from_secs(60))
            .with_default_agent(AgentEntry::command("parked", vec![]));
        let orchestrator = Arc::new(RunOrchestrator::new(
            config,
            Arc::new(ParkedBackend {
                launched: launched.clone(),
            }),
        ));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let task = Task::new(&repo, "p").with_id("a");
            async move { orchestrator.submit(task).await }
        });
        launched.notified().await;

        let second = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let task = Task::new(&repo, "p").with_id("b");
            async move { orchestrator.submit(task).await }
        });
        while !orchestrator.active_runs().contains(&"b".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(orchestrator.cancel("b"));

        let queued = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("queued run should return promptly")
            .unwrap();
        assert_eq!(queued.status, RunStatus::Cancelled);
        assert_eq!(queued.phase(), RunPhase::Done);
        assert!(queued.sandbox_id.is_none());
        assert!(!tmp.path().join("runs/b").exists());

        assert!(orchestrator.cancel("a"));
        let running = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .expect("running run should stop on cancel")
            .unwrap();
        assert_eq!(running.status, RunStatus::Cancelled);
        assert_eq!(running.sandbox_id.as_deref(), Some("parked-1"));
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let first = ActiveRun::register(&registry, "a", CancellationToken::new());
        assert!(first.is_some());
        assert!(ActiveRun::register(&registry, "a", CancellationToken::new()).is_none());
        drop(first);
        assert!(ActiveRun::register(&registry, "a", CancellationToken::new()).is_some());
    }
}
