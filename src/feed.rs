//! Boundary to the upstream message feed.
//!
//! The broker consumer pushes decoded invocations into the ingress
//! channel; the feed forwards them to the pool one at a time, never
//! exceeding `max_in_flight` unacknowledged runs. Every `Processed`
//! signal from the pool frees one slot. When the pool is saturated,
//! invocations simply wait in the ingress channel — the pool never
//! pulls, the feed pushes.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::container_pool::events::{FeedSignal, PoolMsg};
use crate::container_pool::ContainerPoolHandle;
use crate::objects::{ActivationMessage, ExecutableAction, RunRequest};

/// A decoded invocation handed over by the broker consumer.
pub type ActivationEnvelope = (ExecutableAction, ActivationMessage);

pub struct MessageFeed {
    max_in_flight: usize,
    in_flight: usize,
    pool: ContainerPoolHandle,
}

impl MessageFeed {
    /// Spawn the feed task.
    ///
    /// `max_in_flight` must equal the pool's active-container cap; the
    /// pool relies on it for backpressure.
    pub fn spawn(
        max_in_flight: usize,
        ingress_rx: mpsc::Receiver<ActivationEnvelope>,
        processed_rx: mpsc::UnboundedReceiver<FeedSignal>,
        pool: ContainerPoolHandle,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let feed = Self {
            max_in_flight,
            in_flight: 0,
            pool,
        };
        tokio::spawn(
            feed.run(ingress_rx, processed_rx, cancel_token)
                .instrument(tracing::info_span!("message_feed")),
        )
    }

    async fn run(
        mut self,
        mut ingress_rx: mpsc::Receiver<ActivationEnvelope>,
        mut processed_rx: mpsc::UnboundedReceiver<FeedSignal>,
        cancel_token: CancellationToken,
    ) {
        info!(max_in_flight = self.max_in_flight, "Message feed starting");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                maybe_signal = processed_rx.recv() => match maybe_signal {
                    None => break,
                    Some(FeedSignal::Processed) => self.handle_processed(),
                },
                maybe_envelope = ingress_rx.recv(), if self.in_flight < self.max_in_flight => {
                    match maybe_envelope {
                        None => {
                            info!("Ingress closed, stopping feed");
                            break;
                        }
                        Some((action, msg)) => self.deliver(action, msg),
                    }
                },
            }
        }
        info!(in_flight = self.in_flight, "Message feed stopped");
    }

    fn deliver(&mut self, action: ExecutableAction, msg: ActivationMessage) {
        self.in_flight += 1;
        debug!(
            action = %action.fqn(),
            activation_id = %msg.activation_id,
            in_flight = self.in_flight,
            "Delivering run to pool"
        );
        self.pool.send(PoolMsg::Run(RunRequest::new(action, msg)));
    }

    fn handle_processed(&mut self) {
        if self.in_flight == 0 {
            warn!("Processed signal with no runs in flight");
            return;
        }
        self.in_flight -= 1;
    }
}
