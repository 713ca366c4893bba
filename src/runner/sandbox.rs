//! Sandbox environment for isolated agent execution.
//!
//! A [`SandboxBackend`] knows how to start an isolated environment (a Docker
//! container or a local process group). The [`SandboxExecutor`] drives one
//! launched [`SandboxHandle`] through wait, budget expiry or cancellation and
//! tears it down exactly once on every path.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RunConfig;
use super::harness::{HARNESS_FILE, PROBLEM_FILE};
use super::task::AgentEntry;
use super::workspace::Workspace;
use crate::error::SandboxError;
use crate::execution::ExecutionLimits;
use crate::metrics::MetricsCollector;

/// Per-stream cap on captured output.
pub const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Mount point of the repository copy inside a container.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Mount point of the read-only inputs inside a container.
pub const INPUT_MOUNT: &str = "/input";
/// Mount point of the writable output directory inside a container.
pub const OUTPUT_MOUNT: &str = "/output";

/// Variables the runner always sets; agent-declared values cannot override them.
pub const RESERVED_ENV: &[&str] = &[
    "INFERENCE_URL",
    "API_KEY",
    "PYTHONUNBUFFERED",
    "PYTHONDONTWRITEBYTECODE",
    "RUN_ID",
    "AGENT_WORKSPACE",
    "AGENT_INPUT",
    "AGENT_OUTPUT",
    "PROBLEM_STATEMENT_FILE",
    "PATH",
    "HOME",
];

/// Outbound network access granted to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network at all.
    #[default]
    Isolated,
    /// Attached only to a named network (where the inference proxy lives).
    Restricted { network: String },
    /// Default bridge network. Per-host filtering is not available.
    Open,
}

impl NetworkPolicy {
    /// Docker `network_mode` for this policy.
    pub fn docker_network_mode(&self) -> String {
        match self {
            Self::Isolated => "none".to_string(),
            Self::Restricted { network } => network.clone(),
            Self::Open => "bridge".to_string(),
        }
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::Restricted { network } => write!(f, "{network}"),
            Self::Open => write!(f, "open"),
        }
    }
}

impl FromStr for NetworkPolicy {
    type Err = String;

    /// `isolated`/`none`, `open`/`bridge`, or the name of a network.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("network policy cannot be empty".to_string()),
            "isolated" | "none" => Ok(Self::Isolated),
            "open" | "bridge" => Ok(Self::Open),
            "host" => Err("host networking is not allowed".to_string()),
            name => Ok(Self::Restricted {
                network: name.to_string(),
            }),
        }
    }
}

/// Volume mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path.
    pub host_path: PathBuf,
    /// Container path.
    pub container_path: PathBuf,
    /// Whether the mount is read-only.
    pub readonly: bool,
}

impl VolumeMount {
    /// Creates a new read-write volume mount.
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            readonly: false,
        }
    }

    /// Creates a read-only volume mount.
    pub fn readonly(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            readonly: true,
        }
    }

    /// Returns the Docker mount string format.
    pub fn to_docker_mount(&self) -> String {
        let ro = if self.readonly { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.display(),
            self.container_path.display(),
            ro
        )
    }
}

/// Everything a backend needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Task id; used for naming and labelling.
    pub run_id: String,
    /// Container image (ignored by the process backend).
    pub image: String,
    /// Command and arguments, already expressed in sandbox-visible paths.
    pub command: Vec<String>,
    /// Repository copy; also the working directory.
    pub workspace: VolumeMount,
    /// Further mounts (inputs, outputs).
    pub mounts: Vec<VolumeMount>,
    /// Complete environment. Nothing else is inherited.
    pub env: BTreeMap<String, String>,
    /// Resource ceilings.
    pub limits: ExecutionLimits,
    /// Network policy.
    pub network: NetworkPolicy,
}

/// Output captured from a finished or killed sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A way of starting isolated environments.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// The path under which the agent sees `mount`.
    fn visible_path(&self, mount: &VolumeMount) -> PathBuf;

    /// Starts a sandbox. On error nothing is left running.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError>;

    /// Removes whatever a `launch` for `run_id` that was dropped before it
    /// returned may have left behind. Returns how many sandboxes it removed.
    async fn discard(&self, _run_id: &str) -> Result<usize, SandboxError> {
        Ok(0)
    }
}

/// A live sandbox.
#[async_trait]
pub trait SandboxHandle: Send {
    /// Backend-specific identifier (container id, process group id).
    fn id(&self) -> &str;

    /// Waits for the agent to exit and returns its exit code.
    ///
    /// Must be cancel-safe: dropping the future leaves the sandbox running.
    async fn wait(&mut self) -> Result<i64, SandboxError>;

    /// Force-terminates everything in the sandbox. Succeeds if it already exited.
    async fn kill(&mut self) -> Result<(), SandboxError>;

    /// Returns the captured stdout and stderr.
    async fn output(&mut self) -> Result<CapturedOutput, SandboxError>;

    /// Releases the sandbox's resources. Called exactly once.
    async fn release(&mut self) -> Result<(), SandboxError>;
}

/// How the agent's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Exited with status 0.
    Completed,
    /// Killed after the wall-clock budget expired.
    Timeout,
    /// Exited with a non-zero status.
    Crashed,
    /// Killed on external cancellation.
    Cancelled,
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    /// Exit status when the agent exited on its own.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Identifier of the sandbox, if one was launched.
    pub sandbox_id: Option<String>,
}

impl ExecutionOutcome {
    fn cancelled_before_launch(elapsed: Duration) -> Self {
        Self {
            kind: OutcomeKind::Cancelled,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
            sandbox_id: None,
        }
    }
}

enum Launched {
    Ready(Result<Box<dyn SandboxHandle>, SandboxError>),
    TimedOut,
    Cancelled,
}

enum Waited {
    Exited(Result<i64, SandboxError>),
    TimedOut,
    Cancelled,
}

/// Runs agents inside sandboxes of one backend.
#[derive(Clone)]
pub struct SandboxExecutor {
    backend: Arc<dyn SandboxBackend>,
    metrics: MetricsCollector,
}

impl SandboxExecutor {
    /// Creates an executor over `backend`.
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            metrics: MetricsCollector::new(),
        }
    }

    /// Name of the underlying backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Builds the launch description for one run.
    pub fn launch_spec(
        &self,
        run_id: &str,
        workspace: &Workspace,
        agent: &AgentEntry,
        config: &RunConfig,
    ) -> LaunchSpec {
        let repo = VolumeMount::new(workspace.repo_dir(), WORKSPACE_MOUNT);
        let input = VolumeMount::readonly(workspace.input_dir(), INPUT_MOUNT);
        let output = VolumeMount::new(workspace.output_dir(), OUTPUT_MOUNT);

        let repo_path = self.backend.visible_path(&repo);
        let input_path = self.backend.visible_path(&input);
        let output_path = self.backend.visible_path(&output);

        let mut env = BTreeMap::new();
        for (key, value) in &config.agent_env {
            if RESERVED_ENV.contains(&key.as_str()) {
                warn!(run_id = %run_id, var = %key, "Ignoring agent variable that shadows a runner variable");
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
        env.insert("INFERENCE_URL".to_string(), config.inference_url.clone());
        if let Some(key) = &config.api_key {
            env.insert("API_KEY".to_string(), key.clone());
        }
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        env.insert("RUN_ID".to_string(), run_id.to_string());
        env.insert("AGENT_WORKSPACE".to_string(), path_string(&repo_path));
        env.insert("AGENT_INPUT".to_string(), path_string(&input_path));
        env.insert("AGENT_OUTPUT".to_string(), path_string(&output_path));
        env.insert(
            "PROBLEM_STATEMENT_FILE".to_string(),
            path_string(&input_path.join(PROBLEM_FILE)),
        );

        let command: Vec<String> = match agent {
            AgentEntry::Command { program, args } => {
                std::iter::once(program.clone()).chain(args.iter().cloned()).collect()
            }
            AgentEntry::AgentMain { .. } => vec![
                config.python.clone(),
                path_string(&input_path.join(HARNESS_FILE)),
            ],
        };

        LaunchSpec {
            run_id: run_id.to_string(),
            image: config.image.clone(),
            command,
            workspace: repo,
            mounts: vec![input, output],
            env,
            limits: config.limits.clone(),
            network: config.network.clone(),
        }
    }

    /// Runs `agent` against `workspace` under `config`'s budget.
    ///
    /// Returns `Err` only when the sandbox could not be launched or supervised;
    /// timeouts, crashes and cancellations are outcomes. The sandbox is torn
    /// down on every path before this returns.
    pub async fn execute(
        &self,
        run_id: &str,
        workspace: &Workspace,
        agent: &AgentEntry,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if cancel.is_cancelled() {
            info!(run_id = %run_id, "Run cancelled before sandbox launch");
            return Ok(ExecutionOutcome::cancelled_before_launch(Duration::ZERO));
        }

        if config.network == NetworkPolicy::Open {
            warn!(
                run_id = %run_id,
                "Sandbox has open network access; outbound traffic is not filtered"
            );
        }

        let spec = self.launch_spec(run_id, workspace, agent, config);
        let launch_started = Instant::now();
        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Launched::Cancelled,
            res = self.backend.launch(&spec) => Launched::Ready(res),
            _ = tokio::time::sleep(config.launch_timeout) => Launched::TimedOut,
        };
        let mut handle = match launched {
            Launched::Ready(res) => res?,
            Launched::Cancelled => {
                info!(run_id = %run_id, "Run cancelled during sandbox launch");
                self.discard_launch(run_id, config.teardown_grace).await;
                return Ok(ExecutionOutcome::cancelled_before_launch(
                    launch_started.elapsed(),
                ));
            }
            Launched::TimedOut => {
                self.discard_launch(run_id, config.teardown_grace).await;
                return Err(SandboxError::Launch(format!(
                    "sandbox did not start within {}s",
                    config.launch_timeout.as_secs_f64()
                )));
            }
        };
        let start = Instant::now();
        let sandbox_id = handle.id().to_string();
        self.metrics.sandbox_started();

        info!(
            run_id = %run_id,
            sandbox = %sandbox_id,
            backend = self.backend.name(),
            agent = %agent.describe(),
            timeout_secs = config.timeout.as_secs(),
            "Sandbox started"
        );

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            res = handle.wait() => Waited::Exited(res),
            _ = tokio::time::sleep(config.timeout) => Waited::TimedOut,
        };
        let elapsed = start.elapsed();

        let grace = config.teardown_grace;
        // Also reaps anything the agent left running after its main process exited.
        self.teardown_step(grace, "kill", &sandbox_id, handle.kill())
            .await;
        let output = self
            .teardown_step(grace, "output", &sandbox_id, handle.output())
            .await
            .unwrap_or_default();
        self.teardown_step(grace, "release", &sandbox_id, handle.release())
            .await;
        self.metrics.sandbox_released();

        let (kind, exit_code) = match waited {
            Waited::Exited(Ok(0)) => (OutcomeKind::Completed, Some(0)),
            Waited::Exited(Ok(code)) => (OutcomeKind::Crashed, Some(code)),
            Waited::Exited(Err(e)) => return Err(e),
            Waited::TimedOut => (OutcomeKind::Timeout, None),
            Waited::Cancelled => (OutcomeKind::Cancelled, None),
        };

        info!(
            run_id = %run_id,
            sandbox = %sandbox_id,
            outcome = ?kind,
            exit_code = ?exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sandbox finished"
        );

        Ok(ExecutionOutcome {
            kind,
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
            sandbox_id: Some(sandbox_id),
        })
    }

    /// Cleans up after a launch that was abandoned mid-way.
    async fn discard_launch(&self, run_id: &str, grace: Duration) {
        if let Some(removed) = self
            .teardown_step(grace, "discard", run_id, self.backend.discard(run_id))
            .await
        {
            if removed > 0 {
                info!(run_id = %run_id, removed, "Removed partially launched sandbox");
            }
        }
    }

    /// Runs one teardown step bounded by `grace`; failures are logged.
    async fn teardown_step<T>(
        &self,
        grace: Duration,
        step: &'static str,
        sandbox_id: &str,
        fut: impl Future<Output = Result<T, SandboxError>>,
    ) -> Option<T> {
        match tokio::time::timeout(grace, fut).await {
            Ok(Ok(value)) => {
                debug!(sandbox = %sandbox_id, step, "Teardown step done");
                Some(value)
            }
            Ok(Err(e)) => {
                warn!(sandbox = %sandbox_id, step, error = %e, "Teardown step failed");
                self.metrics.record_teardown_failure(step);
                None
            }
            Err(_) => {
                warn!(
                    sandbox = %sandbox_id,
                    step,
                    grace_ms = grace.as_millis() as u64,
                    "Teardown step exceeded grace period"
                );
                self.metrics.record_teardown_failure(step);
                None
            }
        }
    }
}

fn path_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}
