//! Per-container state machine.
//!
//! Each proxy is a tokio task owning exactly one runtime container. It
//! serializes jobs against the container, reports state transitions to
//! the pool supervisor, and self-destructs on idle timeout or on a
//! `Remove` command. Lifecycle:
//!
//! ```text
//! Uninitialized ── Start ──▶ Started(prewarmed) ──┐
//!       │                                         ├─ Run ──▶ Running ──▶ Started(warm) ⇄ Paused
//!       └───────── Run (cold) ────────────────────┘                │
//!                                                         Removing ──▶ Removed
//! ```
//!
//! The mailbox keeps draining while a job runs: a concurrent `Run` is
//! rejected with `RescheduleJob` and re-posted to the supervisor on the
//! job's behalf.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::container_pool::events::PoolMsg;
use crate::driver::{ContainerDriver, RunError, RuntimeContainer};
use crate::objects::{
    ContainerData, ContainerId, ExecKind, MemoryMb, PreWarmedData, RunRequest, WarmedData,
};

/// Commands the pool sends to a container proxy.
pub enum ProxyMsg {
    /// Boot a prewarmed runtime of the given kind and memory. Only the
    /// kind and memory cross this boundary; tenant code never does.
    Start { kind: ExecKind, memory: MemoryMb },
    /// Execute one invocation.
    Run(RunRequest),
    /// Destroy the container and terminate.
    Remove,
}

/// Mailbox handle for one container proxy.
#[derive(Clone)]
pub struct ProxyHandle {
    id: ContainerId,
    tx: mpsc::UnboundedSender<ProxyMsg>,
}

impl ProxyHandle {
    pub fn new(id: ContainerId, tx: mpsc::UnboundedSender<ProxyMsg>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Deliver a message; a closed mailbox means the proxy is already
    /// terminating and will announce itself via `ContainerRemoved`.
    pub fn send(&self, msg: ProxyMsg) {
        let _ = self.tx.send(msg);
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// An idle container is destroyed after this long without work.
    pub idle_timeout: Duration,
    /// A warm container is paused after this long without work.
    pub pause_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            pause_grace: Duration::from_millis(50),
        }
    }
}

/// Creates container workers for the pool.
///
/// The pool only ever asks for a blank worker; everything else travels
/// through the worker's mailbox. Tests substitute a recording factory.
pub trait ContainerFactory: Send + Sync {
    fn create_worker(&self) -> ProxyHandle;
}

/// Production factory: spawns a [`ContainerProxy`] task per worker.
pub struct ProxyFactory {
    driver: Arc<dyn ContainerDriver>,
    pool_tx: mpsc::UnboundedSender<PoolMsg>,
    config: ProxyConfig,
}

impl ProxyFactory {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        pool_tx: mpsc::UnboundedSender<PoolMsg>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            driver,
            pool_tx,
            config,
        }
    }
}

impl ContainerFactory for ProxyFactory {
    fn create_worker(&self) -> ProxyHandle {
        let id = ContainerId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProxyHandle::new(id.clone(), tx);

        let proxy = ContainerProxy {
            id: id.clone(),
            handle: handle.clone(),
            driver: self.driver.clone(),
            pool_tx: self.pool_tx.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(
            proxy
                .run(rx)
                .instrument(tracing::info_span!("container_proxy", container_id = %id)),
        );

        handle
    }
}

enum ExecOutcome {
    /// Job handled; the proxy stays alive.
    Continue,
    /// The proxy has terminated (container destroyed or never created).
    Stop,
}

/// The per-container task. Owns the container exclusively; all state
/// lives on this task's stack.
struct ContainerProxy {
    id: ContainerId,
    handle: ProxyHandle,
    driver: Arc<dyn ContainerDriver>,
    pool_tx: mpsc::UnboundedSender<PoolMsg>,
    config: ProxyConfig,
}

impl ContainerProxy {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ProxyMsg>) {
        let mut container: Option<RuntimeContainer> = None;
        let mut data: Option<ContainerData> = None;
        let mut paused = false;
        let mut last_activity = Instant::now();

        loop {
            let pause_at = last_activity + self.config.pause_grace;
            let idle_at = last_activity + self.config.idle_timeout;
            let can_pause =
                !paused && container.is_some() && matches!(data, Some(ContainerData::Warmed(_)));

            tokio::select! {
                maybe_msg = rx.recv() => match maybe_msg {
                    None => {
                        self.destroy(container.take(), "mailbox closed").await;
                        return;
                    }
                    Some(ProxyMsg::Remove) => {
                        self.destroy(container.take(), "remove requested").await;
                        return;
                    }
                    Some(ProxyMsg::Start { kind, memory }) => {
                        if container.is_some() {
                            warn!("Ignoring Start for an already-started container");
                            continue;
                        }
                        match self.driver.create(&kind, memory).await {
                            Ok(created) => {
                                debug!(
                                    runtime_id = %created.id,
                                    kind = %kind,
                                    memory = %memory,
                                    "Prewarm container started"
                                );
                                container = Some(created);
                                let prewarmed = PreWarmedData { kind, memory };
                                data = Some(ContainerData::PreWarmed(prewarmed.clone()));
                                last_activity = Instant::now();
                                self.send_pool(PoolMsg::NeedWork {
                                    worker: self.handle.clone(),
                                    data: ContainerData::PreWarmed(prewarmed),
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to start prewarm container");
                                self.send_pool(PoolMsg::ContainerRemoved { id: self.id.clone() });
                                return;
                            }
                        }
                    }
                    Some(ProxyMsg::Run(run)) => {
                        match self
                            .execute(&mut rx, &mut container, &mut data, &mut paused, run)
                            .await
                        {
                            ExecOutcome::Continue => last_activity = Instant::now(),
                            ExecOutcome::Stop => return,
                        }
                    }
                },
                _ = tokio::time::sleep_until(pause_at), if can_pause => {
                    let Some(c) = container.as_ref() else { continue };
                    match self.driver.pause(c).await {
                        Ok(()) => {
                            debug!("Container paused");
                            paused = true;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to pause container, removing");
                            self.destroy(container.take(), "pause failed").await;
                            return;
                        }
                    }
                },
                _ = tokio::time::sleep_until(idle_at) => {
                    self.destroy(container.take(), "idle timeout").await;
                    return;
                },
            }
        }
    }

    /// Execute one invocation. On transient failures (container would
    /// not start, run never reached the container) the job is handed
    /// back to the supervisor for rescheduling and the proxy
    /// self-destructs; anything past that point is terminal.
    async fn execute(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ProxyMsg>,
        container: &mut Option<RuntimeContainer>,
        data: &mut Option<ContainerData>,
        paused: &mut bool,
        run: RunRequest,
    ) -> ExecOutcome {
        // Cold start: the slot was handed out before any container existed.
        if container.is_none() {
            match self
                .driver
                .create(&run.action.kind, run.action.memory)
                .await
            {
                Ok(created) => *container = Some(created),
                Err(e) => {
                    warn!(
                        action = %run.action.fqn(),
                        error = %e,
                        "Container would not start; rescheduling run"
                    );
                    self.reschedule(run);
                    // No container was created; nothing to remove.
                    self.send_pool(PoolMsg::ContainerRemoved { id: self.id.clone() });
                    return ExecOutcome::Stop;
                }
            }
        }
        let Some(current) = container.as_ref() else {
            return ExecOutcome::Stop;
        };

        if *paused {
            if let Err(e) = self.driver.resume(current).await {
                warn!(error = %e, "Failed to resume container; rescheduling run");
                self.reschedule(run);
                self.destroy(container.take(), "resume failed").await;
                return ExecOutcome::Stop;
            }
            *paused = false;
        }

        // Load tenant code on first use (cold or promoted prewarm).
        if !matches!(data, Some(ContainerData::Warmed(_))) {
            if let Err(e) = self.driver.initialize(current, &run.action).await {
                // Init may have had side effects inside the runtime;
                // the activation is lost and accounted by the pool.
                warn!(
                    action = %run.action.fqn(),
                    activation_id = %run.msg.activation_id,
                    error = %e,
                    "Failed to initialize action; removing container"
                );
                self.destroy(container.take(), "init failed").await;
                return ExecOutcome::Stop;
            }
        }

        debug!(
            action = %run.action.fqn(),
            activation_id = %run.msg.activation_id,
            "Executing activation"
        );

        // Keep draining the mailbox while the job runs: at most one
        // in-flight job per container, so concurrent Runs are bounced.
        let mut remove_after = false;
        let mut poisoned = false;
        let result = {
            let run_fut = self.driver.run(current, &run.action, &run.msg);
            tokio::pin!(run_fut);
            let mut mailbox_open = true;
            loop {
                tokio::select! {
                    res = &mut run_fut => break res,
                    maybe_msg = rx.recv(), if mailbox_open => match maybe_msg {
                        None => {
                            mailbox_open = false;
                            remove_after = true;
                        }
                        Some(ProxyMsg::Remove) => remove_after = true,
                        Some(ProxyMsg::Run(other)) => {
                            self.send_pool(PoolMsg::RescheduleJob { id: self.id.clone() });
                            self.repost(other);
                            poisoned = true;
                        }
                        Some(ProxyMsg::Start { .. }) => {
                            warn!("Ignoring Start for a running container");
                        }
                    },
                }
            }
        };

        match result {
            Ok(response) => {
                debug!(
                    activation_id = %run.msg.activation_id,
                    response = %response,
                    "Activation completed"
                );
                if poisoned || remove_after {
                    self.destroy(container.take(), "removal during run").await;
                    return ExecOutcome::Stop;
                }
                let warmed = WarmedData {
                    kind: run.action.kind.clone(),
                    memory: run.action.memory,
                    invocation_namespace: run.msg.namespace.clone(),
                    action: run.action.clone(),
                    last_used: std::time::Instant::now(),
                };
                *data = Some(ContainerData::Warmed(warmed.clone()));
                self.send_pool(PoolMsg::NeedWork {
                    worker: self.handle.clone(),
                    data: ContainerData::Warmed(warmed),
                });
                ExecOutcome::Continue
            }
            Err(RunError::NotStarted(e)) => {
                info!(
                    activation_id = %run.msg.activation_id,
                    error = %e,
                    "Run never reached the container; rescheduling"
                );
                self.reschedule(run);
                self.destroy(container.take(), "run not started").await;
                ExecOutcome::Stop
            }
            Err(RunError::Aborted(e)) => {
                warn!(
                    activation_id = %run.msg.activation_id,
                    error = %e,
                    "Activation aborted; removing container"
                );
                self.destroy(container.take(), "run aborted").await;
                ExecOutcome::Stop
            }
        }
    }

    /// Hand a job back to the supervisor: drop this worker from the
    /// pool maps and re-post the run on the job's behalf.
    fn reschedule(&self, run: RunRequest) {
        self.send_pool(PoolMsg::RescheduleJob {
            id: self.id.clone(),
        });
        self.repost(run);
    }

    fn repost(&self, run: RunRequest) {
        let _ = self.pool_tx.send(PoolMsg::Run(run));
    }

    fn send_pool(&self, msg: PoolMsg) {
        let _ = self.pool_tx.send(msg);
    }

    /// Destroy the container (if any) and announce termination.
    async fn destroy(&self, container: Option<RuntimeContainer>, reason: &str) {
        if let Some(c) = container {
            if let Err(e) = self.driver.remove(&c).await {
                warn!(runtime_id = %c.id, error = %e, "Failed to remove container");
            }
        }
        info!(reason = reason, event = "container_removed", "Container proxy terminating");
        self.send_pool(PoolMsg::ContainerRemoved {
            id: self.id.clone(),
        });
    }
}
