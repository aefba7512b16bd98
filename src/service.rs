//! Wires the pool, proxies, drivers and feed together and owns the
//! service lifecycle.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{DriverConfig, InvokerConfig};
use crate::container_pool::events::PoolMsg;
use crate::container_pool::ContainerPool;
use crate::container_proxy::ProxyFactory;
use crate::driver::{ContainerDriver, DockerDriver, ForkExecDriver};
use crate::feed::{ActivationEnvelope, MessageFeed};
use crate::metrics::PoolMetrics;

/// Capacity of the ingress buffer between the broker consumer and the
/// feed; invocations wait here while the pool is saturated.
const INGRESS_BUFFER: usize = 128;

pub struct InvokerService {
    config: InvokerConfig,
}

impl InvokerService {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    fn build_driver(&self) -> Result<Arc<dyn ContainerDriver>> {
        match &self.config.driver {
            DriverConfig::ForkExec {
                runtime_dir,
                work_dir,
            } => Ok(Arc::new(ForkExecDriver::new(runtime_dir, work_dir))),
            DriverConfig::Docker {
                address,
                image_prefix,
            } => Ok(Arc::new(DockerDriver::new(
                address.as_deref(),
                image_prefix.clone(),
            )?)),
        }
    }

    /// Start the pool, feed and metrics, and run until a shutdown
    /// signal arrives.
    pub async fn start(&self) -> Result<()> {
        crate::metrics::init_provider(
            &self.config.telemetry,
            &self.config.instance_id(),
            &self.config.invoker_id,
        )?;

        let cancel_token = CancellationToken::new();
        let (ingress_tx, ingress_rx) = mpsc::channel::<ActivationEnvelope>(INGRESS_BUFFER);
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        let driver = self.build_driver()?;
        let metrics = Arc::new(PoolMetrics::new());
        let proxy_config = self.config.proxy.to_proxy_config();

        let pool = ContainerPool::spawn(
            self.config.pool.clone(),
            feed_tx,
            metrics,
            cancel_token.clone(),
            move |pool_tx| Arc::new(ProxyFactory::new(driver, pool_tx, proxy_config)),
        )?;

        let feed_handle = MessageFeed::spawn(
            self.config.pool.max_active_containers,
            ingress_rx,
            feed_rx,
            pool.clone(),
            cancel_token.clone(),
        );

        info!(
            invoker_id = %self.config.invoker_id,
            env = %self.config.env,
            "Invoker started, press Ctrl+C to shutdown"
        );

        // Kept alive for the lifetime of the service; an embedding
        // broker consumer would clone this to push work.
        let _ingress = ingress_tx;

        shutdown_signal().await;

        info!("Invoker shutting down gracefully");
        pool.send(PoolMsg::Shutdown);
        cancel_token.cancel();
        let _ = feed_handle.await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
