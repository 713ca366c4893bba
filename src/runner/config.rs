//! Configuration for agent runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sandbox::NetworkPolicy;
use super::task::{AgentEntry, Task};
use crate::execution::ExecutionLimits;

/// Default image for the Docker backend.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Caller-supplied settings shared by every run of one orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Inference endpoint exposed to the agent as `INFERENCE_URL`.
    pub inference_url: String,
    /// Credential exposed to the agent as `API_KEY`.
    pub api_key: Option<String>,
    /// Wall-clock budget for the agent.
    pub timeout: Duration,
    /// Root under which per-task run directories are created.
    pub runs_dir: PathBuf,
    /// Entry point used when a task does not name one.
    pub default_agent: Option<AgentEntry>,
    /// Container image (Docker backend).
    pub image: String,
    /// Python interpreter used to start `agent_main` agents.
    pub python: String,
    /// Resource ceilings.
    pub limits: ExecutionLimits,
    /// Network policy for the sandbox.
    pub network: NetworkPolicy,
    /// Extra agent-declared environment variables.
    pub agent_env: BTreeMap<String, String>,
    /// Keep repo/input/output directories after a finished run.
    pub keep_workspaces: bool,
    /// Upper bound on each teardown step (kill, log capture, release).
    pub teardown_grace: Duration,
    /// Upper bound on starting the sandbox, image pull included.
    pub launch_timeout: Duration,
}

impl RunConfig {
    /// Creates a configuration pointing the agent at `inference_url`.
    pub fn new(inference_url: impl Into<String>) -> Self {
        Self {
            inference_url: inference_url.into(),
            api_key: None,
            timeout: Duration::from_secs(600),
            runs_dir: PathBuf::from("./runs"),
            default_agent: None,
            image: DEFAULT_IMAGE.to_string(),
            python: "python3".to_string(),
            limits: ExecutionLimits::default(),
            network: NetworkPolicy::Isolated,
            agent_env: BTreeMap::new(),
            keep_workspaces: false,
            teardown_grace: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(300),
        }
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the runs directory.
    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = dir.into();
        self
    }

    /// Sets the default agent entry point.
    pub fn with_default_agent(mut self, agent: AgentEntry) -> Self {
        self.default_agent = Some(agent);
        self
    }

    /// Sets the Docker image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the Python interpreter.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Sets resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the network policy.
    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    /// Adds an environment variable for the agent.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.agent_env.insert(key.into(), value.into());
        self
    }

    /// Keeps sandbox directories after the run.
    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    /// Sets the teardown grace period.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Sets the launch timeout.
    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    /// Returns the configuration effective for `task`, with its overrides
    /// applied and its environment merged over the runner's.
    pub fn for_task(&self, task: &Task) -> Self {
        let mut config = self.clone();
        if let Some(timeout) = task.timeout {
            config.timeout = timeout;
        }
        if let Some(limits) = &task.limits {
            config.limits = limits.clone();
        }
        if let Some(agent) = &task.agent {
            config.default_agent = Some(agent.clone());
        }
        config
            .agent_env
            .extend(task.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        config
    }

    /// Gets the run directory of a task.
    pub fn run_dir(&self, task_id: &str) -> PathBuf {
        self.runs_dir.join(task_id)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new("http://localhost:8001")
    }
}
