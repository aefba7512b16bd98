//! HTTP client for the action runtime interface exposed inside every
//! container (`/init` to load code, `/run` to execute an activation).

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::debug;

use super::RunError;
use crate::objects::{ActivationMessage, ExecutableAction};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client for one container's action runtime interface.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    http: reqwest::Client,
    base_url: String,
}

impl RuntimeClient {
    pub fn new(addr: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build runtime http client")?;
        Ok(Self {
            http,
            base_url: format!("http://{}", addr),
        })
    }

    /// Wait until the runtime accepts TCP connections, retrying until
    /// the deadline.
    pub async fn wait_for_ready(addr: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(stream) => {
                    drop(stream);
                    return Ok(());
                }
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        anyhow::bail!(
                            "Timeout waiting for runtime at {} after {:?}: {}",
                            addr,
                            timeout,
                            e
                        );
                    }
                    debug!(addr = %addr, error = %e, "Runtime not ready, retrying...");
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Load the action's code into the runtime.
    pub async fn init(&self, action: &ExecutableAction) -> Result<()> {
        let body = json!({
            "value": {
                "name": action.name,
                "main": "main",
                "binary": false,
            }
        });

        let response = self
            .http
            .post(format!("{}/init", self.base_url))
            .json(&body)
            .timeout(action.timeout)
            .send()
            .await
            .context("Init request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Init returned {}: {}", status, text);
        }
        Ok(())
    }

    /// Execute one activation. Classifies failures into
    /// [`RunError::NotStarted`] (request never sent, safe to retry
    /// elsewhere) and [`RunError::Aborted`] (possible side effects).
    pub async fn run(
        &self,
        action: &ExecutableAction,
        activation: &ActivationMessage,
    ) -> std::result::Result<serde_json::Value, RunError> {
        let body = json!({
            "value": activation.args,
            "namespace": activation.namespace,
            "action_name": action.fqn(),
            "activation_id": activation.activation_id,
            "transaction_id": activation.transaction_id,
            "deadline": action.timeout.as_millis() as u64,
        });

        let response = self
            .http
            .post(format!("{}/run", self.base_url))
            .json(&body)
            .timeout(action.timeout)
            .send()
            .await
            .map_err(|e| {
                // A connect failure means no bytes reached the runtime.
                if e.is_connect() {
                    RunError::NotStarted(anyhow::Error::new(e).context("Connecting to runtime"))
                } else {
                    RunError::Aborted(anyhow::Error::new(e).context("Run request"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RunError::Aborted(anyhow::anyhow!(
                "Run returned {}: {}",
                status,
                text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RunError::Aborted(anyhow::Error::new(e).context("Decoding run response")))
    }
}
