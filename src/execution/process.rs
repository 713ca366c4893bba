//! Local process-group sandbox backend.
//!
//! The agent runs as a direct child in its own process group with a cleared
//! environment and POSIX rlimits applied between `fork()` and `execve()`.
//! Teardown sends SIGKILL to the whole group, so grandchildren die too.
//!
//! This backend isolates the environment and the process tree, not the
//! filesystem or the network. It is meant for development and tests; the
//! Docker backend is the isolation boundary in production.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::execution::resources::ExecutionLimits;
use crate::runner::sandbox::{
    CapturedOutput, LaunchSpec, NetworkPolicy, SandboxBackend, SandboxHandle, VolumeMount,
    MAX_OUTPUT_BYTES,
};

/// Runs agents as local process groups.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend {
    apply_limits: bool,
}

impl ProcessBackend {
    /// Creates a backend that applies rlimits to every agent.
    pub fn new() -> Self {
        Self { apply_limits: true }
    }

    /// Enables or disables rlimits.
    pub fn with_limits(mut self, apply: bool) -> Self {
        self.apply_limits = apply;
        self
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn visible_path(&self, mount: &VolumeMount) -> PathBuf {
        mount.host_path.clone()
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Launch("empty agent command".to_string()))?;

        if spec.network != NetworkPolicy::Open {
            debug!(
                run_id = %spec.run_id,
                network = %spec.network,
                "Process backend cannot restrict network access"
            );
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.workspace.host_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        // The interpreter must still be resolvable.
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        if self.apply_limits {
            attach_rlimits(&mut cmd, &spec.limits);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("Failed to spawn '{program}': {e}")))?;

        let pgid = match child.id() {
            Some(pid) => pid as libc::pid_t,
            None => {
                return Err(SandboxError::Launch(format!(
                    "'{program}' exited before it could be tracked"
                )))
            }
        };

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_bounded(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_bounded(s)));

        debug!(run_id = %spec.run_id, pgid, program = %program, "Spawned agent process group");

        Ok(Box::new(ProcessSandbox {
            id: format!("pgid-{pgid}"),
            pgid,
            child,
            stdout,
            stderr,
            exit_code: None,
            released: false,
        }))
    }
}

/// A running process group.
pub struct ProcessSandbox {
    id: String,
    pgid: libc::pid_t,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    exit_code: Option<i64>,
    released: bool,
}

impl ProcessSandbox {
    fn kill_group(&self) -> io::Result<()> {
        kill_process_group(self.pgid)
    }
}

#[async_trait]
impl SandboxHandle for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i64, SandboxError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await.map_err(|e| SandboxError::Wait {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        let code = exit_code(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.kill_group().map_err(|e| SandboxError::Teardown {
            id: self.id.clone(),
            reason: format!("killpg failed: {e}"),
        })
    }

    async fn output(&mut self) -> Result<CapturedOutput, SandboxError> {
        let stdout = join_reader(&mut self.stdout).await;
        let stderr = join_reader(&mut self.stderr).await;
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn release(&mut self) -> Result<(), SandboxError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        for reader in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            reader.abort();
        }

        let killed = self.kill_group();
        if self.exit_code.is_none() {
            // Reap the leader so no zombie is left behind.
            let status = self.child.wait().await.map_err(|e| SandboxError::Teardown {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
            self.exit_code = Some(exit_code(status));
        }

        killed.map_err(|e| SandboxError::Teardown {
            id: self.id.clone(),
            reason: format!("killpg failed: {e}"),
        })
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        if !self.released {
            warn!(sandbox = %self.id, "Process sandbox dropped without release; killing group");
            let _ = self.kill_group();
        }
    }
}

/// Sends SIGKILL to a process group. A group that no longer exists is not an error.
pub fn kill_process_group(pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group id"));
    }
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Exit code, or `128 + signal` for a signalled process (shell convention).
fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(signal)) => 128 + signal as i64,
        (None, None) => -1,
    }
}

/// Drains a pipe to EOF, keeping at most `MAX_OUTPUT_BYTES`.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

async fn join_reader(reader: &mut Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader.as_mut() {
        Some(handle) => {
            let bytes = handle.await.unwrap_or_default();
            *reader = None;
            bytes
        }
        None => Vec::new(),
    }
}

#[cfg(target_os = "linux")]
#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

/// Applies the limits to the child between `fork()` and `execve()`.
///
/// Limits are only ever lowered: a value above the inherited hard limit is
/// clamped to it rather than failing the spawn.
fn attach_rlimits(cmd: &mut Command, limits: &ExecutionLimits) {
    let max_open_files = limits.max_open_files;
    let address_space = limits.memory_mb.saturating_mul(1024 * 1024);

    // SAFETY: the hook only calls getrlimit/setrlimit, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            if max_open_files > 0 {
                lower_rlimit(libc::RLIMIT_NOFILE, max_open_files)?;
            }
            if address_space > 0 {
                lower_rlimit(libc::RLIMIT_AS, address_space)?;
            }
            lower_rlimit(libc::RLIMIT_CORE, 0)?;
            Ok(())
        });
    }
}

fn lower_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let wanted = value as libc::rlim_t;
    let hard = if current.rlim_max == libc::RLIM_INFINITY {
        wanted
    } else {
        wanted.min(current.rlim_max)
    };
    let rlim = libc::rlimit {
        rlim_cur: hard,
        rlim_max: hard,
    };
    // SAFETY: `rlim` is a valid rlimit.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
