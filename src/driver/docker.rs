use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::service::HostConfig;
use bollard::Docker as DockerClient;

use super::{ContainerDriver, RunError, RuntimeClient, RuntimeContainer};
use crate::objects::{ActivationMessage, ExecKind, ExecutableAction, MemoryMb};

/// Port the action runtime listens on inside the container.
const RUNTIME_PORT: u16 = 8080;
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker-backed container driver.
pub struct DockerDriver {
    client: DockerClient,
    /// Image registry prefix, e.g. `ghcr.io/acme`.
    image_prefix: String,
}

impl DockerDriver {
    pub fn new(address: Option<&str>, image_prefix: String) -> Result<Self> {
        let client = match address {
            Some(addr) if addr.starts_with("http") || addr.starts_with("tcp") => {
                DockerClient::connect_with_http_defaults()
                    .context("Failed to connect to Docker daemon over http")?
            }
            Some(addr) => DockerClient::connect_with_unix(
                addr,
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon over unix socket")?,
            None => DockerClient::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };
        Ok(Self {
            client,
            image_prefix,
        })
    }

    /// Resolve a runtime kind to its image, e.g. `nodejs:20` →
    /// `<prefix>/runtime-nodejs:20`.
    fn runtime_image(&self, kind: &ExecKind) -> String {
        let family = kind.family();
        let version = kind.as_str().strip_prefix(family).map(|v| v.trim_start_matches(':'));
        match version {
            Some(v) if !v.is_empty() => format!("{}/runtime-{}:{}", self.image_prefix, family, v),
            _ => format!("{}/runtime-{}:latest", self.image_prefix, family),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, kind: &ExecKind, memory: MemoryMb) -> Result<RuntimeContainer> {
        let name = format!("invoker-{}", uuid::Uuid::new_v4());
        let image = self.runtime_image(kind);

        tracing::info!(
            container_name = %name,
            image = %image,
            kind = %kind,
            memory = %memory,
            "Creating runtime container"
        );

        let host_config = HostConfig {
            memory: Some(memory.bytes() as i64),
            memory_swap: Some(memory.bytes() as i64),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("invoker.kind".to_string(), kind.as_str().to_string());

        let body = ContainerCreateBody {
            image: Some(image),
            hostname: Some(name.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };

        self.client
            .create_container(Some(options), body)
            .await
            .context("Failed to create container")?;

        self.client
            .start_container(&name, None::<StartContainerOptions>)
            .await
            .context("Failed to start container")?;

        let info = self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let ip = info
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Container {} has no IP address", name))?;

        let addr = format!("{}:{}", ip, RUNTIME_PORT);
        RuntimeClient::wait_for_ready(&addr, READY_TIMEOUT).await?;

        Ok(RuntimeContainer { id: name, addr })
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
        self.client
            .pause_container(&container.id)
            .await
            .with_context(|| format!("Failed to pause container {}", container.id))
    }

    async fn resume(&self, container: &RuntimeContainer) -> Result<()> {
        self.client
            .unpause_container(&container.id)
            .await
            .with_context(|| format!("Failed to unpause container {}", container.id))
    }

    async fn remove(&self, container: &RuntimeContainer) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.client
            .remove_container(&container.id, Some(options))
            .await
            .with_context(|| format!("Failed to remove container {}", container.id))
    }
}
