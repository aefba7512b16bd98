use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use super::{ContainerDriver, RunError, RuntimeClient, RuntimeContainer};
use crate::objects::{ActivationMessage, ExecKind, ExecutableAction, MemoryMb};

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);
const FIRST_RUNTIME_PORT: u16 = 18080;

/// Tracks a running runtime process.
struct ProcessHandle {
    child: Child,
    work_dir: PathBuf,
}

/// Fork-exec based driver that runs action runtimes as local
/// subprocesses instead of containers. Intended for local development
/// and tests; isolation is limited to what the OS process model gives.
pub struct ForkExecDriver {
    /// Directory holding one runtime binary per family,
    /// `<runtime_dir>/<family>/runtime`.
    runtime_dir: PathBuf,
    work_dir: PathBuf,
    /// Map of container id to process handle.
    processes: Arc<RwLock<HashMap<String, ProcessHandle>>>,
    next_port: AtomicU16,
}

impl ForkExecDriver {
    pub fn new(runtime_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            work_dir: work_dir.into(),
            processes: Arc::new(RwLock::new(HashMap::new())),
            next_port: AtomicU16::new(FIRST_RUNTIME_PORT),
        }
    }

    fn runtime_binary(&self, kind: &ExecKind) -> PathBuf {
        self.runtime_dir.join(kind.family()).join("runtime")
    }

    #[cfg(unix)]
    fn signal(child: &Child, signal: i32) -> Result<()> {
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Process has already exited"))?;
        let rc = unsafe { libc::kill(pid as i32, signal) };
        if rc != 0 {
            anyhow::bail!(
                "kill({}, {}) failed: {}",
                pid,
                signal,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for ForkExecDriver {
    async fn create(&self, kind: &ExecKind, memory: MemoryMb) -> Result<RuntimeContainer> {
        let id = format!("fork-exec-{}", uuid::Uuid::new_v4());
        let binary = self.runtime_binary(kind);
        let work_dir = self.work_dir.join(&id);
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            container_id = %id,
            binary = %binary.display(),
            kind = %kind,
            memory = %memory,
            port = port,
            "Spawning runtime process"
        );

        tokio::fs::create_dir_all(&work_dir)
            .await
            .context("Failed to create working directory")?;

        let child = Command::new(&binary)
            .current_dir(&work_dir)
            .env("RUNTIME_PORT", port.to_string())
            .env("RUNTIME_MEMORY_MB", memory.0.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn runtime: {}", binary.display()))?;

        let addr = format!("127.0.0.1:{}", port);
        let handle = ProcessHandle { child, work_dir };
        self.processes.write().await.insert(id.clone(), handle);

        if let Err(e) = RuntimeClient::wait_for_ready(&addr, READY_TIMEOUT).await {
            // Boot failure: reap the process before reporting.
            if let Some(mut handle) = self.processes.write().await.remove(&id) {
                let _ = handle.child.kill().await;
            }
            return Err(e);
        }

        Ok(RuntimeContainer { id, addr })
    }

    async fn initialize(
        &self,
        container: &RuntimeContainer,
        action: &ExecutableAction,
    ) -> Result<()> {
        RuntimeClient::new(&container.addr)?.init(action).await
    }

    async fn run(
        &self,
        container: &RuntimeContainer,
        action: &ExecutableAction,
        activation: &ActivationMessage,
    ) -> std::result::Result<serde_json::Value, RunError> {
        let client = RuntimeClient::new(&container.addr).map_err(RunError::NotStarted)?;
        client.run(action, activation).await
    }

    async fn pause(&self, container: &RuntimeContainer) -> Result<()> {
        let processes = self.processes.read().await;
        let handle = processes
            .get(&container.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown container {}", container.id))?;
        #[cfg(unix)]
        Self::signal(&handle.child, libc::SIGSTOP)?;
        Ok(())
    }

    async fn resume(&self, container: &RuntimeContainer) -> Result<()> {
        let processes = self.processes.read().await;
        let handle = processes
            .get(&container.id)
            .ok_or_else(|| anyhow::anyhow!("Unknown container {}", container.id))?;
        #[cfg(unix)]
        Self::signal(&handle.child, libc::SIGCONT)?;
        Ok(())
    }

    async fn remove(&self, container: &RuntimeContainer) -> Result<()> {
        let Some(mut handle) = self.processes.write().await.remove(&container.id) else {
            tracing::warn!(
                container_id = %container.id,
                "Process not found, may have already terminated"
            );
            return Ok(());
        };

        // A paused process would never see SIGTERM; wake it first.
        #[cfg(unix)]
        {
            let _ = Self::signal(&handle.child, libc::SIGCONT);
            let _ = Self::signal(&handle.child, libc::SIGTERM);
        }

        match tokio::time::timeout(KILL_GRACE_PERIOD, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    container_id = %container.id,
                    status = ?status,
                    "Runtime process terminated"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    container_id = %container.id,
                    error = %e,
                    "Error waiting for runtime process"
                );
            }
            Err(_) => {
                tracing::warn!(
                    container_id = %container.id,
                    "Runtime process did not terminate in time, forcing kill"
                );
                handle
                    .child
                    .kill()
                    .await
                    .context("Failed to kill runtime process")?;
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&handle.work_dir).await {
            tracing::warn!(
                work_dir = %handle.work_dir.display(),
                error = %e,
                "Failed to clean up working directory"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_binary_path() {
        let driver = ForkExecDriver::new("/opt/runtimes", "/tmp/invoker");
        assert_eq!(
            driver.runtime_binary(&ExecKind::new("nodejs:20")),
            PathBuf::from("/opt/runtimes/nodejs/runtime")
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_container_is_noop() {
        let driver = ForkExecDriver::new("/opt/runtimes", "/tmp/invoker");
        let container = RuntimeContainer {
            id: "missing".to_string(),
            addr: "127.0.0.1:1".to_string(),
        };
        assert!(driver.remove(&container).await.is_ok());
    }
}
