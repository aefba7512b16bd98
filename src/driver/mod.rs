//! Boundary to the container runtime.
//!
//! The pool and proxies only command the runtime through
//! [`ContainerDriver`]; the concrete drivers here are a Docker driver
//! and a fork-exec driver for local subprocess runtimes. Both expose
//! the same action-runtime HTTP protocol (`/init`, `/run`) inside the
//! container.

mod docker;
mod fork_exec;
mod runtime_client;

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerDriver;
pub use fork_exec::ForkExecDriver;
pub use runtime_client::RuntimeClient;
use thiserror::Error;

use crate::objects::{ActivationMessage, ExecKind, ExecutableAction, MemoryMb};

/// Handle to a created runtime container.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    /// Driver-assigned container identity (Docker container id, pid, ...).
    pub id: String,
    /// Address of the action runtime interface inside the container.
    pub addr: String,
}

/// Failure of a run attempt against a container.
///
/// The distinction matters for rescheduling: a request that provably
/// never reached the container can be retried on another worker; one
/// that may have had side effects cannot.
#[derive(Debug, Error)]
pub enum RunError {
    /// The request never reached the container; the activation had no
    /// side effects and is safe to reschedule.
    #[error("run request never reached the container: {0}")]
    NotStarted(#[source] anyhow::Error),
    /// The request was (or may have been) delivered; the activation is
    /// lost and the container must be destroyed.
    #[error("run aborted after delivery to the container: {0}")]
    Aborted(#[source] anyhow::Error),
}

/// Commands the pool issues to the container runtime.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create and boot a container for the given runtime kind and
    /// memory bound. The returned container has a live runtime but no
    /// tenant code.
    async fn create(&self, kind: &ExecKind, memory: MemoryMb) -> Result<RuntimeContainer>;

    /// Load the action's code into the container runtime.
    async fn initialize(
        &self,
        container: &RuntimeContainer,
        action: &ExecutableAction,
    ) -> Result<()>;

    /// Execute one activation against an initialized container.
    async fn run(
        &self,
        container: &RuntimeContainer,
        action: &ExecutableAction,
        activation: &ActivationMessage,
    ) -> std::result::Result<serde_json::Value, RunError>;

    /// Suspend an idle container.
    async fn pause(&self, container: &RuntimeContainer) -> Result<()>;

    /// Resume a paused container.
    async fn resume(&self, container: &RuntimeContainer) -> Result<()>;

    /// Destroy the container and release its resources.
    async fn remove(&self, container: &RuntimeContainer) -> Result<()>;
}
