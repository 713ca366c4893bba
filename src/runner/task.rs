//! Task definitions: what a single run executes and against which repository.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::execution::ExecutionLimits;

/// How the agent is started inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEntry {
    /// Run a command verbatim with the workspace as working directory.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A Python module (file or directory containing `agent.py`) exposing
    /// `agent_main(input, repo_dir)`, started through the bundled harness.
    AgentMain { file: PathBuf },
}

impl AgentEntry {
    /// Creates a command entry point.
    pub fn command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self::Command {
            program: program.into(),
            args,
        }
    }

    /// Creates an `agent_main` entry point.
    pub fn agent_main(file: impl Into<PathBuf>) -> Self {
        Self::AgentMain { file: file.into() }
    }

    /// Short human-readable description used in logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Command { program, .. } => format!("command:{program}"),
            Self::AgentMain { file } => format!("agent_main:{}", file.display()),
        }
    }
}

/// One evaluation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, also the name of the run directory.
    pub id: String,
    /// Base repository: a directory or a `.tar.gz` archive.
    pub repo: PathBuf,
    /// Problem statement handed to the agent.
    pub problem_statement: String,
    /// Agent entry point. Falls back to the runner default when absent.
    pub agent: Option<AgentEntry>,
    /// Per-task wall-clock budget override.
    pub timeout: Option<Duration>,
    /// Per-task resource limit override.
    pub limits: Option<ExecutionLimits>,
    /// Agent-declared environment variables.
    pub env: BTreeMap<String, String>,
}

impl Task {
    /// Creates a task with a fresh v4 id.
    pub fn new(repo: impl Into<PathBuf>, problem_statement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            repo: repo.into(),
            problem_statement: problem_statement.into(),
            agent: None,
            timeout: None,
            limits: None,
            env: BTreeMap::new(),
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the agent entry point.
    pub fn with_agent(mut self, agent: AgentEntry) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Overrides the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Adds an agent-declared environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Returns true if the id is usable as a single path component.
    pub fn has_valid_id(&self) -> bool {
        is_valid_run_id(&self.id)
    }

    /// Loads a task from a YAML file.
    ///
    /// Relative `repo` and agent paths resolve against the file's directory.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&content, base).map_err(|e| match e {
            RunnerError::InvalidTask { reason, .. } => RunnerError::InvalidTask {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parses a task from YAML text, resolving relative paths against `base`.
    pub fn from_yaml_str(content: &str, base: &Path) -> Result<Self, RunnerError> {
        let file: TaskFile = serde_yaml::from_str(content)?;
        let invalid = |reason: &str| RunnerError::InvalidTask {
            path: base.to_path_buf(),
            reason: reason.to_string(),
        };

        let problem_statement = match (file.problem_statement, file.problem_statement_file) {
            (Some(text), None) => text,
            (None, Some(p)) => fs::read_to_string(resolve(base, &p))?,
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "set either problem_statement or problem_statement_file, not both",
                ))
            }
            (None, None) => return Err(invalid("missing problem_statement")),
        };

        let agent = file.agent.map(|agent| match agent {
            AgentEntry::AgentMain { file } => AgentEntry::AgentMain {
                file: resolve(base, &file),
            },
            other => other,
        });

        let task = Self {
            id: file.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            repo: resolve(base, &file.repo),
            problem_statement,
            agent,
            timeout: file.timeout_secs.map(Duration::from_secs),
            limits: file.limits,
            env: file.env,
        };

        if !task.has_valid_id() {
            return Err(invalid("id must use letters, digits, '.', '_' or '-'"));
        }

        Ok(task)
    }
}

/// On-disk YAML shape of a task.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    id: Option<String>,
    repo: PathBuf,
    problem_statement: Option<String>,
    problem_statement_file: Option<PathBuf>,
    agent: Option<AgentEntry>,
    timeout_secs: Option<u64>,
    limits: Option<ExecutionLimits>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Run ids become directory and container names.
pub fn is_valid_run_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
