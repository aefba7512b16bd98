//! The container pool supervisor.
//!
//! Single sequential owner of all scheduling state: the `free`, `busy`
//! and `prewarmed` maps are only ever touched from this task, one
//! message at a time. Container proxies are parallel workers that
//! report back through the pool's mailbox; no shared mutable state
//! crosses the boundary.

pub mod events;
pub mod scheduling;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use self::events::{FeedSignal, PoolMsg};
use self::types::{ContainerStartState, Worker};
use crate::config::PoolConfig;
use crate::container_proxy::{ContainerFactory, ProxyHandle, ProxyMsg};
use crate::metrics::PoolMetrics;
use crate::objects::{ContainerData, ContainerId, ExecKind, MemoryMb, RunRequest};

/// Mailbox handle for the pool supervisor.
#[derive(Clone)]
pub struct ContainerPoolHandle {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl ContainerPoolHandle {
    pub fn from_sender(tx: mpsc::UnboundedSender<PoolMsg>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: PoolMsg) {
        let _ = self.tx.send(msg);
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<PoolMsg> {
        self.tx.clone()
    }
}

/// The pool supervisor task state.
pub struct ContainerPool {
    config: PoolConfig,
    factory: Arc<dyn ContainerFactory>,
    /// Warm or just-created containers available for work.
    pub(crate) free: HashMap<ContainerId, Worker>,
    /// Containers currently executing a job.
    pub(crate) busy: HashMap<ContainerId, Worker>,
    /// Initialized containers not yet assigned to a tenant. Not counted
    /// against the active-container cap.
    pub(crate) prewarmed: HashMap<ContainerId, Worker>,
    self_tx: mpsc::UnboundedSender<PoolMsg>,
    feed_tx: mpsc::UnboundedSender<FeedSignal>,
    metrics: Arc<PoolMetrics>,
    /// Pool-full error logs are suppressed until this instant, so fresh
    /// runs arriving during a saturated burst share one deadline.
    next_full_log_at: Option<Instant>,
}

impl ContainerPool {
    /// Spawn the supervisor as a tokio task. Fails fast on invalid
    /// configuration; the pool refuses to start.
    ///
    /// `make_factory` receives the pool's own mailbox sender so the
    /// workers it creates can report back (`NeedWork`,
    /// `ContainerRemoved`, `RescheduleJob`, re-posted runs).
    pub fn spawn<F>(
        config: PoolConfig,
        feed_tx: mpsc::UnboundedSender<FeedSignal>,
        metrics: Arc<PoolMetrics>,
        cancel_token: CancellationToken,
        make_factory: F,
    ) -> Result<ContainerPoolHandle>
    where
        F: FnOnce(mpsc::UnboundedSender<PoolMsg>) -> Arc<dyn ContainerFactory>,
    {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let factory = make_factory(tx.clone());
        let pool = Self::new(config, factory, tx.clone(), feed_tx, metrics);

        tokio::spawn(
            pool.run(rx, cancel_token)
                .instrument(tracing::info_span!("container_pool")),
        );

        Ok(ContainerPoolHandle { tx })
    }

    pub(crate) fn new(
        config: PoolConfig,
        factory: Arc<dyn ContainerFactory>,
        self_tx: mpsc::UnboundedSender<PoolMsg>,
        feed_tx: mpsc::UnboundedSender<FeedSignal>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            config,
            factory,
            free: HashMap::new(),
            busy: HashMap::new(),
            prewarmed: HashMap::new(),
            self_tx,
            feed_tx,
            metrics,
            next_full_log_at: None,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<PoolMsg>,
        cancel_token: CancellationToken,
    ) {
        info!(
            max_active_containers = self.config.max_active_containers,
            prewarm_entries = self.config.prewarm.len(),
            "Container pool starting"
        );
        self.initial_fill();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Container pool cancelled, draining");
                    self.drain();
                    break;
                }
                maybe_msg = rx.recv() => match maybe_msg {
                    None => break,
                    Some(PoolMsg::Shutdown) => {
                        info!("Container pool shutdown requested, draining");
                        self.drain();
                        break;
                    }
                    Some(msg) => self.handle_message(msg),
                },
            }
        }
        info!("Container pool stopped");
    }

    /// Process one message to completion. All pool-state mutations
    /// happen here, serialized by the supervisor task.
    pub(crate) fn handle_message(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Run(run) => self.handle_run(run),
            PoolMsg::NeedWork { worker, data } => self.handle_need_work(worker, data),
            PoolMsg::ContainerRemoved { id } => self.handle_container_removed(id),
            PoolMsg::RescheduleJob { id } => self.handle_reschedule_job(id),
            PoolMsg::Shutdown => self.drain(),
        }
    }

    /// Boot the configured prewarm population.
    pub(crate) fn initial_fill(&mut self) {
        for entry in self.config.prewarm.clone() {
            for _ in 0..entry.count {
                self.start_prewarm(entry.kind.clone(), entry.memory);
            }
        }
    }

    fn handle_run(&mut self, run: RunRequest) {
        if self.busy.len() >= self.config.max_active_containers {
            return self.reschedule(run);
        }

        let Some((id, start_state)) = self.try_admit(&run) else {
            return self.reschedule(run);
        };
        let Some(worker) = self.free.remove(&id) else {
            warn!(container_id = %id, "Scheduled worker vanished from the free pool");
            return self.reschedule(run);
        };

        info!(
            container_id = %id,
            container_state = %start_state,
            action = %run.action.fqn(),
            namespace = %run.msg.namespace,
            activation_id = %run.msg.activation_id,
            event = "container_start",
            "Scheduling run"
        );
        self.metrics.record_container_start(start_state);

        worker.proxy.send(ProxyMsg::Run(run));
        self.busy.insert(id, worker);
    }

    /// Pick at most one creation outcome for a run, in preference
    /// order: warm reuse, prewarm promotion, cold create, recreate on
    /// an evicted slot. Returns a worker id guaranteed to be in `free`.
    fn try_admit(&mut self, run: &RunRequest) -> Option<(ContainerId, ContainerStartState)> {
        if let Some(id) = scheduling::schedule(&run.action, &run.msg.namespace, &self.free) {
            return Some((id.clone(), ContainerStartState::Warm));
        }

        if self.busy.len() + self.free.len() < self.config.max_active_containers {
            if let Some(id) = self.take_prewarmed(&run.action.kind, run.action.memory) {
                return Some((id, ContainerStartState::Prewarmed));
            }
            return Some((self.create_blank_worker(), ContainerStartState::Cold));
        }

        // Capacity is held by idle warm containers: evict the least
        // recently used one and recreate on the freed slot.
        let victim = scheduling::find_oldest_warm(&self.free)?.clone();
        self.evict(&victim);
        let id = self
            .take_prewarmed(&run.action.kind, run.action.memory)
            .unwrap_or_else(|| self.create_blank_worker());
        Some((id, ContainerStartState::Recreated))
    }

    /// Promote a `(kind, memory)`-matching prewarmed worker into `free`
    /// and immediately launch its replacement.
    fn take_prewarmed(&mut self, kind: &ExecKind, memory: MemoryMb) -> Option<ContainerId> {
        let id = self
            .prewarmed
            .iter()
            .find(|(_, worker)| {
                matches!(&worker.data,
                    ContainerData::PreWarmed(p) if &p.kind == kind && p.memory == memory)
            })
            .map(|(id, _)| id.clone())?;

        let worker = self.prewarmed.remove(&id)?;
        self.free.insert(id.clone(), worker);
        self.start_prewarm(kind.clone(), memory);
        Some(id)
    }

    /// Launch a fresh prewarm worker. Takes only `(kind, memory)`;
    /// tenant code cannot cross this boundary.
    fn start_prewarm(&mut self, kind: ExecKind, memory: MemoryMb) {
        debug!(kind = %kind, memory = %memory, "Starting prewarm container");
        self.metrics.record_prewarm_start(&kind);
        let worker = self.factory.create_worker();
        worker.send(ProxyMsg::Start { kind, memory });
        // The worker joins `prewarmed` once it reports NeedWork.
    }

    /// Create a blank worker in `free`; its container is created by the
    /// proxy on the first run.
    fn create_blank_worker(&mut self) -> ContainerId {
        let handle = self.factory.create_worker();
        let id = handle.id().clone();
        self.free
            .insert(id.clone(), Worker::new(handle, ContainerData::NoData));
        id
    }

    fn evict(&mut self, id: &ContainerId) {
        if let Some(worker) = self.free.remove(id) {
            info!(
                container_id = %id,
                data = %worker.data,
                "Evicting least recently used warm container"
            );
            worker.proxy.send(ProxyMsg::Remove);
        }
    }

    /// No outcome for this run: re-post it to the back of our own
    /// queue. The pool-full error log is throttled to once per
    /// `log_message_interval`; the deadline travels with the run.
    fn reschedule(&mut self, mut run: RunRequest) {
        let now = Instant::now();
        let deadline = match (run.retry_log_deadline, self.next_full_log_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if deadline.is_none_or(|d| now >= d) {
            error!(
                free = self.free.len(),
                busy = self.busy.len(),
                prewarmed = self.prewarmed.len(),
                max_active_containers = self.config.max_active_containers,
                action = %run.action.fqn(),
                namespace = %run.msg.namespace,
                "Container pool is full, rescheduling run"
            );
            self.metrics.record_pool_saturation();
            self.next_full_log_at = Some(now + self.config.log_message_interval);
        }
        run.retry_log_deadline = deadline.max(self.next_full_log_at);
        self.metrics.record_run_rescheduled();
        let _ = self.self_tx.send(PoolMsg::Run(run));
    }

    fn handle_need_work(&mut self, worker: ProxyHandle, data: ContainerData) {
        let id = worker.id().clone();
        match data {
            ContainerData::PreWarmed(_) => {
                debug!(container_id = %id, data = %data, "Prewarm container ready");
                self.prewarmed.insert(id, Worker::new(worker, data));
            }
            ContainerData::Warmed(_) => {
                if let Some(mut known) = self.busy.remove(&id) {
                    known.data = data;
                    self.free.insert(id, known);
                    self.notify_feed();
                } else if let Some(known) = self.free.get_mut(&id) {
                    known.data = data;
                } else {
                    // Crossed with an eviction; the removal wins.
                    debug!(container_id = %id, "NeedWork from unknown worker, ignoring");
                }
            }
            ContainerData::NoData => {
                warn!(container_id = %id, "Proxy reported NeedWork without container data");
            }
        }
    }

    fn handle_container_removed(&mut self, id: ContainerId) {
        if self.free.remove(&id).is_some() {
            debug!(container_id = %id, "Removed free container");
            return;
        }
        if self.busy.remove(&id).is_some() {
            debug!(container_id = %id, "Removed busy container, its activation is lost");
            self.notify_feed();
            return;
        }
        if let Some(worker) = self.prewarmed.remove(&id) {
            // Self-heal the prewarm population.
            if let ContainerData::PreWarmed(p) = worker.data {
                info!(
                    container_id = %id,
                    kind = %p.kind,
                    "Prewarmed container died, launching replacement"
                );
                self.start_prewarm(p.kind, p.memory);
            }
        }
    }

    /// The worker hands its job back: drop it from the pool without
    /// debiting the feed. The job was already re-posted by the proxy
    /// and will take a fresh slot when it comes around again.
    fn handle_reschedule_job(&mut self, id: ContainerId) {
        let in_free = self.free.remove(&id).is_some();
        let in_busy = self.busy.remove(&id).is_some();
        if in_free || in_busy {
            debug!(container_id = %id, "Worker gave up its job, dropped from pool");
        }
    }

    fn notify_feed(&self) {
        let _ = self.feed_tx.send(FeedSignal::Processed);
    }

    /// Send `Remove` to every worker and forget them. Used for
    /// cooperative shutdown.
    fn drain(&mut self) {
        let worker_count = self.free.len() + self.busy.len() + self.prewarmed.len();
        for (_, worker) in self
            .free
            .drain()
            .chain(self.busy.drain())
            .chain(self.prewarmed.drain())
        {
            worker.proxy.send(ProxyMsg::Remove);
        }
        info!(worker_count, "Drained container pool");
    }
}
