//! Sandbox backends for agent execution.
//!
//! Two backends implement [`crate::runner::SandboxBackend`]:
//!
//! - [`DockerBackend`]: one hardened container per run, using the bollard crate
//!   for container lifecycle management and resource control.
//! - [`ProcessBackend`] (unix): one local process group per run, for
//!   development and tests.
//!
//! # Example
//!
//! ```ignore
//! use agent_runner::execution::DockerBackend;
//!
//! let backend = DockerBackend::connect().await?;
//! let removed = backend.reap().await?;
//! ```

pub mod container;
pub mod docker_client;
#[cfg(unix)]
pub mod process;
pub mod resources;

pub use container::{ContainerStatus, DockerBackend, DockerSandbox};
pub use docker_client::{ContainerConfig, DockerClient, MANAGED_LABEL, RUN_ID_LABEL};
#[cfg(unix)]
pub use process::ProcessBackend;
pub use resources::ExecutionLimits;
