//! Docker sandbox backend.
//!
//! Each run gets one container, created from a [`LaunchSpec`] with the
//! workspace bind-mounted, labels identifying it as runner-managed, hardened
//! privileges and the run's resource limits. Container states follow this
//! lifecycle:
//!
//! ```text
//! CREATED → RUNNING → EXITED/KILLED → REMOVED
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::execution::docker_client::{ContainerConfig, DockerClient, RUN_ID_LABEL};
use crate::runner::sandbox::{
    CapturedOutput, LaunchSpec, NetworkPolicy, SandboxBackend, SandboxHandle, VolumeMount,
    MAX_OUTPUT_BYTES,
};

/// Status of a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Container is running.
    Running,
    /// Container exited on its own with the given code.
    Exited(i64),
    /// Container was force-terminated.
    Killed,
    /// Container has been removed.
    Removed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Exited(code) => write!(f, "exited({})", code),
            ContainerStatus::Killed => write!(f, "killed"),
            ContainerStatus::Removed => write!(f, "removed"),
        }
    }
}

/// Runs agents in Docker containers.
#[derive(Clone)]
pub struct DockerBackend {
    client: Arc<DockerClient>,
    pull_missing: bool,
    harden: bool,
}

impl DockerBackend {
    /// Wraps an existing client.
    pub fn new(client: DockerClient) -> Self {
        Self {
            client: Arc::new(client),
            pull_missing: true,
            harden: true,
        }
    }

    /// Connects to the local daemon and checks that it answers.
    pub async fn connect() -> Result<Self, SandboxError> {
        let client = DockerClient::new()?;
        client.ping().await?;
        Ok(Self::new(client))
    }

    /// Controls whether missing images are pulled on launch.
    pub fn with_pull_missing(mut self, pull: bool) -> Self {
        self.pull_missing = pull;
        self
    }

    /// Controls capability dropping and `no-new-privileges`.
    pub fn with_hardening(mut self, harden: bool) -> Self {
        self.harden = harden;
        self
    }

    /// Builds the container configuration for one launch.
    pub fn container_config(&self, spec: &LaunchSpec) -> ContainerConfig {
        let name = format!(
            "agent-runner-{}-{}",
            spec.run_id,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        // The agent runs as an unprivileged uid without a passwd entry.
        env.push("HOME=/tmp".to_string());

        let binds = std::iter::once(&spec.workspace)
            .chain(spec.mounts.iter())
            .map(VolumeMount::to_docker_mount)
            .collect();

        let mut config = ContainerConfig::new(name, spec.image.clone())
            .with_cmd(spec.command.clone())
            .with_env(env)
            .with_working_dir(spec.workspace.container_path.to_string_lossy())
            .with_binds(binds)
            .with_limits(spec.limits.clone())
            .with_network_mode(spec.network.docker_network_mode())
            .with_label(RUN_ID_LABEL, spec.run_id.clone())
            .with_hardening(self.harden);

        if let Some(user) = host_user() {
            config = config.with_user(user);
        }
        config
    }

    /// Force-removes every container carrying the runner's label.
    ///
    /// # Returns
    ///
    /// The number of containers removed.
    pub async fn reap(&self) -> Result<usize, SandboxError> {
        let ids = self.client.list_managed_containers().await?;
        Ok(self.remove_all(&ids).await)
    }

    async fn remove_all(&self, ids: &[String]) -> usize {
        let mut removed = 0;
        for id in ids {
            match self.client.remove_container(id).await {
                Ok(()) => {
                    removed += 1;
                    info!(container = %short_id(id), "Reaped leftover container");
                }
                Err(e) => warn!(container = %short_id(id), error = %e, "Failed to reap container"),
            }
        }
        removed
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.client.image_exists(image).await {
            return Ok(());
        }
        if !self.pull_missing {
            return Err(SandboxError::Launch(format!("Image {image} is not available locally")));
        }
        info!(image = %image, "Pulling image");
        self.client.pull_image(image).await
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn visible_path(&self, mount: &VolumeMount) -> PathBuf {
        mount.container_path.clone()
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        if spec.command.is_empty() {
            return Err(SandboxError::Launch("empty agent command".to_string()));
        }
        self.ensure_image(&spec.image).await?;

        let config = self.container_config(spec);
        let id = self.client.create_container(&config).await?;

        if let Err(e) = self.client.start_container(&id).await {
            if let Err(cleanup) = self.client.remove_container(&id).await {
                warn!(container = %short_id(&id), error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e);
        }

        debug!(
            run_id = %spec.run_id,
            container = %short_id(&id),
            name = %config.name,
            network = %spec.network,
            "Container started"
        );
        if matches!(spec.network, NetworkPolicy::Restricted { .. }) {
            debug!(run_id = %spec.run_id, "Outbound traffic limited to the attached network");
        }

        Ok(Box::new(DockerSandbox {
            client: self.client.clone(),
            id,
            status: ContainerStatus::Running,
        }))
    }
    async fn discard(&self, run_id: &str) -> Result<usize, SandboxError> {
        let ids = self.client.list_run_containers(run_id).await?;
        Ok(self.remove_all(&ids).await)
    }
}

/// A managed Docker container with lifecycle tracking.
pub struct DockerSandbox {
    client: Arc<DockerClient>,
    id: String,
    status: ContainerStatus,
}

impl DockerSandbox {
    /// Returns the current status.
    pub fn status(&self) -> &ContainerStatus {
        &self.status
    }
}

#[async_trait]
impl SandboxHandle for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        if let ContainerStatus::Exited(code) = self.status {
            return Ok(code);
        }
        let code = self.client.wait_container(&self.id).await?;
        self.status = ContainerStatus::Exited(code);
        Ok(code)
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        if self.status != ContainerStatus::Running {
            return Ok(());
        }
        self.client.kill_container(&self.id).await?;
        self.status = ContainerStatus::Killed;
        Ok(())
    }

    async fn output(&mut self) -> Result<CapturedOutput, SandboxError> {
        let logs = self.client.get_logs(&self.id, MAX_OUTPUT_BYTES).await?;
        Ok(CapturedOutput {
            stdout: logs.stdout,
            stderr: logs.stderr,
        })
    }

    async fn release(&mut self) -> Result<(), SandboxError> {
        if self.status == ContainerStatus::Removed {
            return Ok(());
        }
        self.client.remove_container(&self.id).await?;
        self.status = ContainerStatus::Removed;
        Ok(())
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        if self.status == ContainerStatus::Removed {
            return;
        }
        warn!(container = %short_id(&self.id), "Container dropped without release; removing");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let id = self.id.clone();
            runtime.spawn(async move {
                if let Err(e) = client.remove_container(&id).await {
                    warn!(container = %short_id(&id), error = %e, "Background removal failed");
                }
            });
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(unix)]
fn host_user() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{uid}:{gid}"))
}

#[cfg(not(unix))]
fn host_user() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::docker_client::MANAGED_LABEL;
    use crate::execution::ExecutionLimits;
    use std::collections::BTreeMap;

    fn launch_spec() -> LaunchSpec {
        let mut env = BTreeMap::new();
        env.insert("RUN_ID".to_string(), "task-7".to_string());
        env.insert("INFERENCE_URL".to_string(), "http://proxy:8001".to_string());
        LaunchSpec {
            run_id: "task-7".to_string(),
            image: "python:3.11-slim".to_string(),
            command: vec!["python3".to_string(), "/input/harness.py".to_string()],
            workspace: VolumeMount::new("/runs/task-7/repo", "/workspace"),
            mounts: vec![
                VolumeMount::readonly("/runs/task-7/input", "/input"),
                VolumeMount::new("/runs/task-7/output", "/output"),
            ],
            env,
            limits: ExecutionLimits::new(1024, 1.0, 128, 1024),
            network: NetworkPolicy::Restricted {
                network: "inference".to_string(),
            },
        }
    }

    // Connecting lazily does not contact the daemon.
    fn backend() -> DockerBackend {
        DockerBackend::new(DockerClient::new().unwrap())
    }

    #[test]
    fn test_container_status_display() {
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Exited(2).to_string(), "exited(2)");
        assert_eq!(ContainerStatus::Killed.to_string(), "killed");
        assert_eq!(ContainerStatus::Removed.to_string(), "removed");
    }

    #[test]
    fn test_container_config_from_launch_spec() {
        let config = backend().container_config(&launch_spec());

        assert!(config.name.starts_with("agent-runner-task-7-"));
        assert_eq!(config.image, "python:3.11-slim");
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(config.network_mode, "inference");
        assert_eq!(
            config.binds,
            vec![
                "/runs/task-7/repo:/workspace".to_string(),
                "/runs/task-7/input:/input:ro".to_string(),
                "/runs/task-7/output:/output".to_string(),
            ]
        );
        assert!(config.env.contains(&"RUN_ID=task-7".to_string()));
        assert!(config.env.contains(&"HOME=/tmp".to_string()));
        assert_eq!(config.labels.get(RUN_ID_LABEL).map(String::as_str), Some("task-7"));
        assert_eq!(config.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert!(config.harden);
        #[cfg(unix)]
        assert!(config.user.is_some());
    }

    #[test]
    fn test_container_names_are_unique() {
        let backend = backend();
        let a = backend.container_config(&launch_spec());
        let b = backend.container_config(&launch_spec());
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_docker_sandbox_lifecycle() {
        let backend = DockerBackend::connect().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut spec = launch_spec();
        spec.image = "alpine:3.19".to_string();
        spec.command = vec!["sh".to_string(), "-c".to_string(), "echo hi; echo oops >&2; exit 4".to_string()];
        spec.workspace = VolumeMount::new(dir.path(), "/workspace");
        spec.mounts.clear();
        spec.network = NetworkPolicy::Isolated;

        let mut handle = backend.launch(&spec).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), 4);
        handle.kill().await.unwrap();
        let output = handle.output().await.unwrap();
        assert_eq!(output.stdout.trim(), "hi");
        assert_eq!(output.stderr.trim(), "oops");
        handle.release().await.unwrap();
    }
}
