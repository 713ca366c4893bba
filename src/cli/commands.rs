//! CLI command definitions for agent-runner.
//!
//! `run` executes one task against an agent and prints the result; `reap`
//! removes containers left behind by an earlier, crashed runner.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::execution::{DockerBackend, ExecutionLimits};
use crate::metrics::init_metrics;
use crate::runner::{
    AgentEntry, NetworkPolicy, RunConfig, RunOrchestrator, RunResult, RunStatus, SandboxBackend,
    Task, DEFAULT_IMAGE,
};

/// Default inference endpoint handed to agents.
const DEFAULT_INFERENCE_URL: &str = "http://localhost:8001";

/// Default root for per-task run directories.
const DEFAULT_RUNS_DIR: &str = "./runs";

/// Sandboxed runner for third-party coding agents.
#[derive(Parser)]
#[command(name = "agent-runner")]
#[command(about = "Run a coding agent against a repository in a sandbox and collect its patch")]
#[command(version)]
#[command(
    long_about = "agent-runner copies a repository into an isolated workspace, runs an agent against it under a time budget, and reports the unified diff of what the agent changed.\n\nExample usage:\n  agent-runner run --repo ./calculator --problem 'Fix add()' --agent-main ./agent.py\n  agent-runner run --backend process --repo ./calculator --problem @problem.md -- ./my-agent --fast"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an agent against one task.
    Run(Box<RunArgs>),

    /// Remove containers left behind by earlier runs.
    Reap(ReapArgs),
}

/// Sandbox backend selection.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// One Docker container per run.
    Docker,
    /// One local process group per run (no filesystem or network isolation).
    Process,
}

/// Arguments for `agent-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task file (YAML). Replaces --repo and --problem.
    #[arg(short = 't', long, conflicts_with_all = ["repo", "problem"])]
    pub task: Option<PathBuf>,

    /// Base repository: a directory or a .tar.gz archive.
    #[arg(short = 'r', long, required_unless_present = "task")]
    pub repo: Option<PathBuf>,

    /// Problem statement, or @FILE to read it from a file.
    #[arg(short = 'p', long, required_unless_present = "task")]
    pub problem: Option<String>,

    /// Task id; also the name of the run directory.
    #[arg(long)]
    pub id: Option<String>,

    /// Python file (or package directory) defining `agent_main`.
    #[arg(long, conflicts_with = "agent_cmd")]
    pub agent_main: Option<PathBuf>,

    /// Command to run as the agent, after `--`.
    #[arg(last = true, value_name = "AGENT_CMD")]
    pub agent_cmd: Vec<String>,

    /// Wall-clock budget in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds allowed for starting the sandbox, image pull included.
    #[arg(long, default_value = "300")]
    pub launch_timeout: u64,

    /// Sandbox backend.
    #[arg(short = 'b', long, value_enum, default_value = "docker")]
    pub backend: BackendKind,

    /// Container image for the Docker backend.
    #[arg(long, default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Do not pull the image when it is missing locally.
    #[arg(long)]
    pub no_pull: bool,

    /// Python interpreter used for --agent-main agents.
    #[arg(long, default_value = "python3")]
    pub python: String,

    /// Memory ceiling in MiB.
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// CPU ceiling in cores (0 = unlimited).
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Network policy: isolated, open, or the name of a restricted network.
    #[arg(long, default_value = "isolated")]
    pub network: NetworkPolicy,

    /// Extra environment variable for the agent (KEY=VALUE, repeatable).
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Inference endpoint handed to the agent.
    #[arg(long, env = "INFERENCE_URL", default_value = DEFAULT_INFERENCE_URL)]
    pub inference_url: String,

    /// Credential handed to the agent.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Root directory for run directories.
    #[arg(long, default_value = DEFAULT_RUNS_DIR)]
    pub runs_dir: PathBuf,

    /// Keep the repo/input/output directories after the run.
    #[arg(long)]
    pub keep_workspace: bool,

    /// Write the full result as JSON to this file.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Output JSON to stdout instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `agent-runner reap`.
#[derive(Parser, Debug)]
pub struct ReapArgs {
    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics disabled");
    }

    match cli.command {
        Commands::Run(args) => run_task_command(*args).await,
        Commands::Reap(args) => run_reap_command(args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_task_command(args: RunArgs) -> anyhow::Result<()> {
    let task = build_task(&args)?;
    let config = build_config(&args);
    let backend = build_backend(&args).await?;

    info!(
        task_id = %task.id,
        backend = backend.name(),
        repo = %task.repo.display(),
        "Running task"
    );

    let orchestrator = RunOrchestrator::new(config, backend);
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator.submit_with_cancel(task, cancel).await;

    if let Some(path) = &args.output {
        result
            .save(path)
            .with_context(|| format!("Failed to write result to {}", path.display()))?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    match (&result.status, &result.failure) {
        (RunStatus::Failed, Some(failure)) => Err(anyhow::anyhow!(
            "Run failed ({}): {}",
            failure.kind,
            failure.message
        )),
        _ => Ok(()),
    }
}

fn build_task(args: &RunArgs) -> anyhow::Result<Task> {
    let mut task = match &args.task {
        Some(path) => Task::from_yaml_file(path)?,
        None => {
            let repo = args.repo.clone().context("--repo is required without --task")?;
            let problem = args
                .problem
                .as_deref()
                .context("--problem is required without --task")?;
            Task::new(repo, read_problem(problem)?)
        }
    };

    if let Some(id) = &args.id {
        task = task.with_id(id.clone());
    }
    if let Some(agent) = agent_from_args(args) {
        task = task.with_agent(agent);
    }
    if let Some(secs) = args.timeout {
        task = task.with_timeout(Duration::from_secs(secs));
    }
    Ok(task)
}

fn build_config(args: &RunArgs) -> RunConfig {
    let mut limits = ExecutionLimits::default();
    if let Some(mb) = args.memory_mb {
        limits = limits.with_memory_mb(mb);
    }
    if let Some(cores) = args.cpus {
        limits = limits.with_cpu_cores(cores);
    }

    let mut config = RunConfig::new(&args.inference_url)
        .with_runs_dir(&args.runs_dir)
        .with_image(&args.image)
        .with_python(&args.python)
        .with_limits(limits)
        .with_network(args.network.clone())
        .with_launch_timeout(Duration::from_secs(args.launch_timeout))
        .with_keep_workspaces(args.keep_workspace);
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key);
    }
    let env: BTreeMap<_, _> = args.env.iter().cloned().collect();
    for (key, value) in env {
        config = config.with_env(key, value);
    }
    config
}

async fn build_backend(args: &RunArgs) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    match args.backend {
        BackendKind::Docker => {
            let backend = DockerBackend::connect()
                .await
                .context("Docker is not reachable; use --backend process for local runs")?
                .with_pull_missing(!args.no_pull);
            Ok(Arc::new(backend))
        }
        #[cfg(unix)]
        BackendKind::Process => {
            warn!("Process backend provides no filesystem or network isolation");
            Ok(Arc::new(crate::execution::ProcessBackend::new()))
        }
        #[cfg(not(unix))]
        BackendKind::Process => Err(anyhow::anyhow!(
            "The process backend is only available on unix"
        )),
    }
}

fn agent_from_args(args: &RunArgs) -> Option<AgentEntry> {
    if let Some(file) = &args.agent_main {
        return Some(AgentEntry::agent_main(file.clone()));
    }
    let (program, rest) = args.agent_cmd.split_first()?;
    Some(AgentEntry::command(program.clone(), rest.to_vec()))
}

/// Reads `@path` references; anything else is the statement itself.
fn read_problem(raw: &str) -> anyhow::Result<String> {
    match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read problem statement from {path}")),
        None => Ok(raw.to_string()),
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn print_result(result: &RunResult) {
    println!("\n=== Agent Run ===");
    println!("Task:      {}", result.task_id);
    println!("Status:    {}", result.status);
    println!("Backend:   {}", result.backend);
    println!("Duration:  {:.1}s", result.elapsed.as_secs_f64());
    if let Some(code) = result.exit_code {
        println!("Exit code: {code}");
    }
    println!("Run dir:   {}", result.run_dir.display());
    if let Some(failure) = &result.failure {
        println!("Failure:   {}: {}", failure.kind, failure.message);
    }

    if !result.changed_files.is_empty() {
        println!("\nChanged files:");
        for file in &result.changed_files {
            println!("  {file}");
        }
    }
    if !result.patch.is_empty() {
        println!("\n{}", result.patch);
    }
}

// ============================================================================
// Reap Command Implementation
// ============================================================================

async fn run_reap_command(args: ReapArgs) -> anyhow::Result<()> {
    let backend = DockerBackend::connect()
        .await
        .context("Docker is not reachable")?;
    let removed = backend.reap().await?;

    if args.json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {removed} leftover container(s)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from([
            "agent-runner",
            "run",
            "--repo",
            "./repo",
            "--problem",
            "Fix it",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.backend, BackendKind::Docker);
                assert_eq!(args.image, DEFAULT_IMAGE);
                assert_eq!(args.network, NetworkPolicy::Isolated);
                assert_eq!(args.runs_dir, PathBuf::from(DEFAULT_RUNS_DIR));
                assert!(args.agent_cmd.is_empty());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_agent_cmd_after_double_dash() {
        let cli = Cli::try_parse_from([
            "agent-runner",
            "run",
            "-r",
            "./repo",
            "-p",
            "x",
            "--backend",
            "process",
            "--",
            "sh",
            "-c",
            "echo hi",
        ])
        .expect("should parse");

        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(args.backend, BackendKind::Process);
        assert_eq!(
            agent_from_args(&args),
            Some(AgentEntry::command("sh", vec!["-c".into(), "echo hi".into()]))
        );
    }

    #[test]
    fn test_run_requires_repo_without_task() {
        assert!(Cli::try_parse_from(["agent-runner", "run", "--problem", "x"]).is_err());
        assert!(Cli::try_parse_from(["agent-runner", "run", "--task", "t.yaml"]).is_ok());
        assert!(
            Cli::try_parse_from(["agent-runner", "run", "--task", "t.yaml", "--repo", "r"])
                .is_err()
        );
    }

    #[test]
    fn test_build_config_applies_flags() {
        let cli = Cli::try_parse_from([
            "agent-runner",
            "run",
            "-r",
            "./repo",
            "-p",
            "x",
            "--memory-mb",
            "512",
            "--cpus",
            "1.5",
            "--network",
            "agents-net",
            "-e",
            "MODEL=small",
            "--api-key",
            "secret",
            "--keep-workspace",
            "--launch-timeout",
            "30",
        ])
        .expect("should parse");
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };

        let config = build_config(&args);
        assert_eq!(config.limits.memory_mb, 512);
        assert_eq!(config.limits.cpu_cores, 1.5);
        assert_eq!(
            config.network,
            NetworkPolicy::Restricted {
                network: "agents-net".into()
            }
        );
        assert_eq!(config.agent_env.get("MODEL").map(String::as_str), Some("small"));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.keep_workspaces);
        assert_eq!(config.launch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_host_network_is_rejected() {
        assert!(Cli::try_parse_from([
            "agent-runner",
            "run",
            "-r",
            "r",
            "-p",
            "x",
            "--network",
            "host"
        ])
        .is_err());
    }

    #[test]
    fn test_read_problem_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("problem.md");
        fs::write(&path, "Fix the bug\n").unwrap();

        assert_eq!(
            read_problem(&format!("@{}", path.display())).unwrap(),
            "Fix the bug\n"
        );
        assert_eq!(read_problem("inline").unwrap(), "inline");
        assert!(read_problem("@/definitely/missing").is_err());
    }

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn test_reap_command() {
        let cli = Cli::try_parse_from(["agent-runner", "reap", "--json"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Reap(ReapArgs { json: true })));
    }
}
