//! Docker API wrapper using the bollard crate.
//!
//! This module provides a high-level interface to the Docker operations a
//! sandbox needs: image provisioning, container create/start/wait/kill,
//! log retrieval and forced removal.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::SandboxError;
use crate::execution::resources::ExecutionLimits;

/// Label attached to every container this runner creates.
pub const MANAGED_LABEL: &str = "agent-runner.managed";

/// Label carrying the task id a container belongs to.
pub const RUN_ID_LABEL: &str = "agent-runner.run-id";

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique name for the container.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Vec<String>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Resource limits for the container.
    pub limits: ExecutionLimits,
    /// Bind mounts (host:container[:ro] format).
    pub binds: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Network mode (e.g., "none", "bridge", or a named network).
    pub network_mode: String,
    /// Labels to attach to the container.
    pub labels: HashMap<String, String>,
    /// Drop all Linux capabilities and forbid privilege escalation.
    pub harden: bool,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            limits: ExecutionLimits::default(),
            binds: Vec::new(),
            user: None,
            network_mode: "none".to_string(),
            labels,
            harden: true,
        }
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Sets environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets bind mounts.
    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    /// Sets the user to run as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Enables or disables capability dropping.
    pub fn with_hardening(mut self, harden: bool) -> Self {
        self.harden = harden;
        self
    }

    fn host_config(&self) -> HostConfig {
        let (cpu_period, cpu_quota) = if self.limits.has_cpu_limit() {
            (Some(self.limits.cpu_period()), Some(self.limits.cpu_quota()))
        } else {
            (None, None)
        };
        let nofile = self.limits.max_open_files as i64;

        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            memory_swap: Some(self.limits.memory_bytes()),
            cpu_period,
            cpu_quota,
            pids_limit: Some(self.limits.max_processes as i64),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(nofile),
                hard: Some(nofile),
            }]),
            network_mode: Some(self.network_mode.clone()),
            binds: if self.binds.is_empty() {
                None
            } else {
                Some(self.binds.clone())
            },
            cap_drop: self.harden.then(|| vec!["ALL".to_string()]),
            security_opt: self
                .harden
                .then(|| vec!["no-new-privileges".to_string()]),
            init: Some(true),
            ..Default::default()
        }
    }
}

/// Output captured from a container, split by stream.
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Unavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Docker daemon not reachable: {e}")))?;
        Ok(())
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, SandboxError> {
        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(config.cmd.clone()),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            labels: Some(config.labels.clone()),
            host_config: Some(config.host_config()),
            // Without a TTY the daemon keeps stdout and stderr apart.
            tty: Some(false),
            open_stdin: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::Launch(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Launch(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Sends SIGKILL to a running container.
    ///
    /// A container that is already stopped or gone is not an error.
    pub async fn kill_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = KillContainerOptions { signal: "SIGKILL" };

        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone_or_stopped(&e) => {
                debug!(container = %id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(SandboxError::Teardown {
                id: id.to_string(),
                reason: format!("Failed to kill container: {e}"),
            }),
        }
    }

    /// Force-removes a container by ID, together with its anonymous volumes.
    ///
    /// A container that no longer exists is not an error.
    pub async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone_or_stopped(&e) => {
                debug!(container = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::Teardown {
                id: id.to_string(),
                reason: format!("Failed to remove container: {e}"),
            }),
        }
    }

    /// Gets logs from a container, keeping stdout and stderr apart.
    ///
    /// Each stream is capped at `max_bytes`.
    pub async fn get_logs(&self, id: &str, max_bytes: usize) -> Result<ContainerLogs, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    append_bounded(&mut stdout, &message, max_bytes);
                }
                Ok(LogOutput::StdErr { message }) => {
                    append_bounded(&mut stderr, &message, max_bytes);
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SandboxError::Wait {
                        id: id.to_string(),
                        reason: format!("Error reading logs: {e}"),
                    });
                }
            }
        }

        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Returns the exit code of a stopped container, or `None` while it is
    /// still created, running, paused or restarting.
    pub async fn exit_code(&self, id: &str) -> Result<Option<i64>, SandboxError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = info.state.ok_or_else(|| SandboxError::Wait {
            id: id.to_string(),
            reason: "Container has no state".to_string(),
        })?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();
        Ok(stopped_exit_code(&status, state.exit_code))
    }

    /// Pulls a Docker image from a registry.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with optional tag (e.g., "python:3.11-slim")
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Launch(format!("Failed to pull image {image}: {e}")))?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Waits for a container to stop running.
    ///
    /// # Returns
    ///
    /// The exit code of the container.
    pub async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            return match result {
                Ok(response) => Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Err(BollardError::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) => Err(SandboxError::Wait {
                    id: id.to_string(),
                    reason: format!("Error waiting for container: {e}"),
                }),
            };
        }

        // If stream is empty, check container state
        self.exit_code(id).await?.ok_or_else(|| SandboxError::Wait {
            id: id.to_string(),
            reason: "Wait stream ended while the container was still running".to_string(),
        })
    }

    /// Lists IDs of every container (running or not) carrying the managed label.
    pub async fn list_managed_containers(&self) -> Result<Vec<String>, SandboxError> {
        self.list_labelled(vec![format!("{MANAGED_LABEL}=true")]).await
    }

    /// Lists IDs of the managed containers created for one run.
    pub async fn list_run_containers(&self, run_id: &str) -> Result<Vec<String>, SandboxError> {
        self.list_labelled(run_label_filters(run_id)).await
    }

    async fn list_labelled(&self, labels: Vec<String>) -> Result<Vec<String>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), labels);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Label filters matching the containers of one run.
fn run_label_filters(run_id: &str) -> Vec<String> {
    vec![
        format!("{MANAGED_LABEL}=true"),
        format!("{RUN_ID_LABEL}={run_id}"),
    ]
}

/// Maps a daemon status string to an exit code once the container has stopped.
fn stopped_exit_code(status: &str, exit_code: Option<i64>) -> Option<i64> {
    match status {
        "exited" | "dead" => Some(exit_code.unwrap_or(-1)),
        _ => None,
    }
}

/// True for daemon responses meaning "no such container" or "not running".
fn is_gone_or_stopped(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8], max_bytes: usize) {
    let room = max_bytes.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("test-container", "python:3.11-slim")
            .with_cmd(vec![
                "python".to_string(),
                "-c".to_string(),
                "print(1)".to_string(),
            ])
            .with_env(vec!["FOO=bar".to_string()])
            .with_working_dir("/workspace")
            .with_user("1000:1000")
            .with_network_mode("bridge")
            .with_label(RUN_ID_LABEL, "task-1");

        assert_eq!(config.name, "test-container");
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.cmd.len(), 3);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.network_mode, "bridge");
        assert_eq!(config.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(config.labels.get(RUN_ID_LABEL).map(String::as_str), Some("task-1"));
    }

    #[test]
    fn test_host_config_limits() {
        let limits = ExecutionLimits::new(1024, 1.5, 64, 2048);
        let config = ContainerConfig::new("test", "ubuntu:22.04")
            .with_limits(limits)
            .with_binds(vec!["/tmp/repo:/workspace".to_string()]);

        let host = config.host_config();
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(150_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.binds.unwrap(), vec!["/tmp/repo:/workspace".to_string()]);
        assert_eq!(host.cap_drop.unwrap(), vec!["ALL".to_string()]);
        assert_eq!(host.ulimits.unwrap()[0].hard, Some(2048));
    }

    #[test]
    fn test_host_config_without_cpu_or_hardening() {
        let config = ContainerConfig::new("test", "ubuntu:22.04")
            .with_limits(ExecutionLimits::default().with_cpu_cores(0.0))
            .with_hardening(false);

        let host = config.host_config();
        assert!(host.cpu_quota.is_none());
        assert!(host.cap_drop.is_none());
        assert!(host.security_opt.is_none());
        assert!(host.binds.is_none());
    }

    #[test]
    fn test_append_bounded() {
        let mut buf = Vec::new();
        append_bounded(&mut buf, b"hello", 8);
        append_bounded(&mut buf, b"world", 8);
        assert_eq!(buf, b"hellowor");
        append_bounded(&mut buf, b"more", 8);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_run_label_filters() {
        assert_eq!(
            run_label_filters("task-7"),
            vec![
                "agent-runner.managed=true".to_string(),
                "agent-runner.run-id=task-7".to_string()
            ]
        );
    }

    #[test]
    fn test_stopped_exit_code() {
        assert_eq!(stopped_exit_code("exited", Some(3)), Some(3));
        assert_eq!(stopped_exit_code("dead", None), Some(-1));
        assert_eq!(stopped_exit_code("running", Some(0)), None);
        assert_eq!(stopped_exit_code("created", None), None);
    }

    #[test]
    fn test_gone_or_stopped() {
        let gone = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(is_gone_or_stopped(&gone));
        assert!(!is_gone_or_stopped(&other));
    }
}
