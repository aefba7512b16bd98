//! Property tests for the container pool: random operation sequences
//! played against the supervisor, with the test acting as every proxy.
//!
//! Checked after every step:
//! - the three pool maps stay pairwise disjoint;
//! - `|busy| + |free|` never exceeds the active-container cap;
//! - prewarmed workers are never evicted by admission;
//! - warm reuse wins over prewarm, prewarm wins over cold;
//! - eviction always picks the least-recently-used warm worker;
//! - every promoted or dead prewarm is replaced with matching
//!   parameters;
//! - `Processed` signals balance jobs finished or lost while busy;
//! - a saturated burst shares one pool-full log deadline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tokio::sync::mpsc;

use crate::config::{PoolConfig, PrewarmEntry};
use crate::container_pool::events::{FeedSignal, PoolMsg};
use crate::container_pool::{scheduling, ContainerPool};
use crate::container_proxy::{ContainerFactory, ProxyHandle, ProxyMsg};
use crate::metrics::PoolMetrics;
use crate::objects::{
    ActivationMessage, ContainerData, ContainerId, ExecKind, ExecutableAction, MemoryMb,
    PreWarmedData, RunRequest, WarmedData,
};

const KINDS: [&str; 2] = ["nodejs:20", "python:3.11"];

#[derive(Debug, Clone)]
enum Op {
    /// Admit an invocation of action `action` by tenant `tenant`.
    Run { action: usize, tenant: usize },
    /// Complete the job on some busy worker, reporting warm-and-idle
    /// with a `last_used` this many seconds in the past.
    CompleteBusy { pick: usize, age_secs: u8 },
    /// Acknowledge some outstanding prewarm `Start`.
    PrewarmReady { pick: usize },
    /// Terminate some pooled worker's container.
    RemoveWorker { pick: usize },
    /// Some pooled worker hands its job back.
    RescheduleJob { pick: usize },
    /// Feed one self-re-posted run back into the pool.
    RedeliverReposted,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize, 0..3usize).prop_map(|(action, tenant)| Op::Run { action, tenant }),
        3 => (0..16usize, 0..120u8)
            .prop_map(|(pick, age_secs)| Op::CompleteBusy { pick, age_secs }),
        2 => (0..16usize).prop_map(|pick| Op::PrewarmReady { pick }),
        1 => (0..16usize).prop_map(|pick| Op::RemoveWorker { pick }),
        1 => (0..16usize).prop_map(|pick| Op::RescheduleJob { pick }),
        2 => Just(Op::RedeliverReposted),
    ]
}

fn config_strategy() -> impl Strategy<Value = PoolConfig> {
    (1..4usize, proptest::option::of((1..3u32, 0..2usize))).prop_map(|(max, prewarm)| PoolConfig {
        max_active_containers: max,
        prewarm: prewarm
            .map(|(count, kind)| {
                vec![PrewarmEntry {
                    count,
                    kind: ExecKind::new(KINDS[kind]),
                    memory: MemoryMb(256),
                }]
            })
            .unwrap_or_default(),
        log_message_interval: Duration::from_secs(10),
    })
}

fn make_run(action: usize, tenant: usize, seq: usize) -> RunRequest {
    RunRequest::new(
        ExecutableAction {
            namespace: "whisk.system".to_string(),
            name: format!("action-{}", action),
            revision: "1".to_string(),
            kind: ExecKind::new(KINDS[action % KINDS.len()]),
            memory: MemoryMb(256),
            timeout: Duration::from_secs(60),
        },
        ActivationMessage {
            activation_id: format!("act-{}", seq),
            transaction_id: "tid".to_string(),
            namespace: format!("tenant-{}", tenant),
            args: serde_json::json!({}),
        },
    )
}

/// Recording factory shared with the harness.
struct TestFactory {
    workers: Mutex<Vec<(ProxyHandle, mpsc::UnboundedReceiver<ProxyMsg>)>>,
}

impl ContainerFactory for TestFactory {
    fn create_worker(&self) -> ProxyHandle {
        let id = ContainerId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProxyHandle::new(id, tx);
        self.workers.lock().unwrap().push((handle.clone(), rx));
        handle
    }
}

/// A message observed on some worker's mailbox during one step.
enum Drained {
    StartSent(ContainerId, ExecKind, MemoryMb),
    RunSent(ContainerId, RunRequest),
    RemoveSent(ContainerId),
}

struct Harness {
    pool: ContainerPool,
    factory: Arc<TestFactory>,
    self_rx: mpsc::UnboundedReceiver<PoolMsg>,
    feed_rx: mpsc::UnboundedReceiver<FeedSignal>,
    max_active: usize,
    /// Last run dispatched to each worker, for fabricating completions.
    last_run: HashMap<ContainerId, RunRequest>,
    /// Prewarm starts not yet acknowledged: (worker, kind, memory).
    pending_prewarms: Vec<(ProxyHandle, ExecKind, MemoryMb)>,
    expected_processed: u64,
    observed_processed: u64,
    seq: usize,
}

impl Harness {
    fn new(config: PoolConfig) -> Self {
        let factory = Arc::new(TestFactory {
            workers: Mutex::new(Vec::new()),
        });
        let (self_tx, self_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let max_active = config.max_active_containers;
        let mut pool = ContainerPool::new(
            config,
            factory.clone(),
            self_tx,
            feed_tx,
            Arc::new(PoolMetrics::new()),
        );
        pool.initial_fill();

        let mut harness = Self {
            pool,
            factory,
            self_rx,
            feed_rx,
            max_active,
            last_run: HashMap::new(),
            pending_prewarms: Vec::new(),
            expected_processed: 0,
            observed_processed: 0,
            seq: 0,
        };
        harness.drain_workers();
        harness
    }

    /// Drain every worker mailbox, updating the model and returning the
    /// messages observed.
    fn drain_workers(&mut self) -> Vec<Drained> {
        let mut events = Vec::new();
        let mut workers = self.factory.workers.lock().unwrap();
        for (handle, rx) in workers.iter_mut() {
            while let Ok(msg) = rx.try_recv() {
                match msg {
                    ProxyMsg::Start { kind, memory } => {
                        events.push(Drained::StartSent(handle.id().clone(), kind.clone(), memory));
                        self.pending_prewarms.push((handle.clone(), kind, memory));
                    }
                    ProxyMsg::Run(run) => {
                        events.push(Drained::RunSent(handle.id().clone(), run.clone()));
                        self.last_run.insert(handle.id().clone(), run);
                    }
                    ProxyMsg::Remove => events.push(Drained::RemoveSent(handle.id().clone())),
                }
            }
        }
        events
    }

    /// Known worker ids, sorted for deterministic picking.
    fn pooled_ids(&self, include_prewarmed: bool) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self
            .pool
            .free
            .keys()
            .chain(self.pool.busy.keys())
            .cloned()
            .collect();
        if include_prewarmed {
            ids.extend(self.pool.prewarmed.keys().cloned());
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Run { action, tenant } => self.apply_run(action, tenant),
            Op::CompleteBusy { pick, age_secs } => self.apply_complete(pick, age_secs),
            Op::PrewarmReady { pick } => self.apply_prewarm_ready(pick),
            Op::RemoveWorker { pick } => self.apply_remove(pick),
            Op::RescheduleJob { pick } => self.apply_reschedule_job(pick),
            Op::RedeliverReposted => self.apply_redeliver(),
        }
        self.check_invariants();
    }

    fn apply_run(&mut self, action: usize, tenant: usize) {
        self.seq += 1;
        let run = make_run(action, tenant, self.seq);

        // Pre-state snapshots for the scheduling assertions.
        let busy_full = self.pool.busy.len() >= self.max_active;
        let warm_match =
            scheduling::schedule(&run.action, &run.msg.namespace, &self.pool.free).cloned();
        let has_room = self.pool.busy.len() + self.pool.free.len() < self.max_active;
        let prewarm_matches: HashSet<ContainerId> = self
            .pool
            .prewarmed
            .iter()
            .filter(|(_, w)| {
                matches!(&w.data, ContainerData::PreWarmed(p)
                    if p.kind == run.action.kind && p.memory == run.action.memory)
            })
            .map(|(id, _)| id.clone())
            .collect();
        let free_warm_before: HashMap<ContainerId, Instant> = self
            .pool
            .free
            .iter()
            .filter_map(|(id, w)| match &w.data {
                ContainerData::Warmed(wd) => Some((id.clone(), wd.last_used)),
                _ => None,
            })
            .collect();
        let prewarmed_before: HashMap<ContainerId, PreWarmedData> = self
            .pool
            .prewarmed
            .iter()
            .filter_map(|(id, w)| match &w.data {
                ContainerData::PreWarmed(p) => Some((id.clone(), p.clone())),
                _ => None,
            })
            .collect();

        self.pool.handle_message(PoolMsg::Run(run.clone()));
        let events = self.drain_workers();

        let receiver = events.iter().find_map(|e| match e {
            Drained::RunSent(id, r) if r.msg.activation_id == run.msg.activation_id => {
                Some(id.clone())
            }
            _ => None,
        });

        if busy_full {
            assert!(receiver.is_none(), "saturated pool must not dispatch");
        } else if let Some(expected) = warm_match {
            // Reuse over everything else.
            assert_eq!(receiver.as_ref(), Some(&expected), "warm match must be reused");
        } else if has_room && !prewarm_matches.is_empty() {
            // Prewarm over cold.
            let got = receiver.expect("matching prewarm must be promoted");
            assert!(
                prewarm_matches.contains(&got),
                "run must land on a matching prewarmed worker"
            );
        }

        // Eviction may only target the least-recently-used warm worker,
        // and never a prewarmed one.
        for event in &events {
            if let Drained::RemoveSent(id) = event {
                assert!(
                    !prewarmed_before.contains_key(id),
                    "admission must never evict a prewarmed worker"
                );
                let evicted_at = free_warm_before
                    .get(id)
                    .expect("eviction victim must have been free and warm");
                let min = free_warm_before.values().min().expect("nonempty");
                assert_eq!(evicted_at, min, "eviction must pick the LRU warm worker");
            }
        }

        // Every prewarm promoted out of `prewarmed` is replaced with
        // the same parameters.
        for (id, prewarm) in &prewarmed_before {
            let still_prewarmed = self.pool.prewarmed.contains_key(id);
            let promoted =
                self.pool.free.contains_key(id) || self.pool.busy.contains_key(id);
            if !still_prewarmed && promoted {
                assert!(
                    events.iter().any(|e| matches!(e,
                        Drained::StartSent(_, kind, memory)
                            if *kind == prewarm.kind && *memory == prewarm.memory)),
                    "promoted prewarm must be replenished with matching parameters"
                );
            }
        }
    }

    fn apply_complete(&mut self, pick: usize, age_secs: u8) {
        let candidates: Vec<ContainerId> = {
            let mut ids: Vec<ContainerId> = self
                .pool
                .busy
                .keys()
                .filter(|id| self.last_run.contains_key(*id))
                .cloned()
                .collect();
            ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            ids
        };
        if candidates.is_empty() {
            return;
        }
        let id = candidates[pick % candidates.len()].clone();
        let run = self.last_run[&id].clone();
        let handle = self.handle_for(&id);

        self.pool.handle_message(PoolMsg::NeedWork {
            worker: handle,
            data: ContainerData::Warmed(WarmedData {
                kind: run.action.kind.clone(),
                memory: run.action.memory,
                invocation_namespace: run.msg.namespace.clone(),
                action: run.action,
                last_used: Instant::now() - Duration::from_secs(age_secs as u64),
            }),
        });
        self.expected_processed += 1;
        self.drain_workers();
    }

    fn apply_prewarm_ready(&mut self, pick: usize) {
        if self.pending_prewarms.is_empty() {
            return;
        }
        let (handle, kind, memory) = self.pending_prewarms.remove(pick % self.pending_prewarms.len());
        self.pool.handle_message(PoolMsg::NeedWork {
            worker: handle,
            data: ContainerData::PreWarmed(PreWarmedData { kind, memory }),
        });
        self.drain_workers();
    }

    fn apply_remove(&mut self, pick: usize) {
        let ids = self.pooled_ids(true);
        if ids.is_empty() {
            return;
        }
        let id = ids[pick % ids.len()].clone();
        if self.pool.busy.contains_key(&id) {
            self.expected_processed += 1;
        }
        self.pool.handle_message(PoolMsg::ContainerRemoved { id });
        self.drain_workers();
    }

    fn apply_reschedule_job(&mut self, pick: usize) {
        let ids = self.pooled_ids(false);
        if ids.is_empty() {
            return;
        }
        let id = ids[pick % ids.len()].clone();
        self.pool.handle_message(PoolMsg::RescheduleJob { id });
        self.drain_workers();
    }

    fn apply_redeliver(&mut self) {
        if let Ok(msg) = self.self_rx.try_recv() {
            self.pool.handle_message(msg);
            self.drain_workers();
        }
    }

    fn handle_for(&self, id: &ContainerId) -> ProxyHandle {
        self.factory
            .workers
            .lock()
            .unwrap()
            .iter()
            .find(|(handle, _)| handle.id() == id)
            .map(|(handle, _)| handle.clone())
            .expect("worker must exist")
    }

    fn check_invariants(&mut self) {
        // The three maps are pairwise disjoint.
        for id in self.pool.free.keys() {
            assert!(!self.pool.busy.contains_key(id), "free ∩ busy must be empty");
            assert!(
                !self.pool.prewarmed.contains_key(id),
                "free ∩ prewarmed must be empty"
            );
        }
        for id in self.pool.busy.keys() {
            assert!(
                !self.pool.prewarmed.contains_key(id),
                "busy ∩ prewarmed must be empty"
            );
        }

        // Active capacity is respected.
        assert!(
            self.pool.busy.len() + self.pool.free.len() <= self.max_active,
            "|busy| + |free| must not exceed the cap"
        );
        assert!(self.pool.busy.len() <= self.max_active);

        // Processed conservation.
        while let Ok(FeedSignal::Processed) = self.feed_rx.try_recv() {
            self.observed_processed += 1;
        }
        assert_eq!(
            self.observed_processed, self.expected_processed,
            "feed must see exactly one Processed per job finished or lost while busy"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn pool_invariants_hold(
        config in config_strategy(),
        ops in proptest::collection::vec(op_strategy(), 1..60),
    ) {
        let mut harness = Harness::new(config);
        harness.check_invariants();
        for op in ops {
            harness.apply(op);
        }
    }

    #[test]
    fn saturated_burst_shares_one_log_deadline(burst in 2..20usize) {
        let mut harness = Harness::new(PoolConfig {
            max_active_containers: 1,
            prewarm: vec![],
            log_message_interval: Duration::from_secs(10),
        });

        // Occupy the single slot.
        harness.apply(Op::Run { action: 0, tenant: 0 });
        prop_assert_eq!(harness.pool.busy.len(), 1);

        for _ in 0..burst {
            harness.apply(Op::Run { action: 1, tenant: 1 });
        }

        let mut deadlines = Vec::new();
        while let Ok(PoolMsg::Run(run)) = harness.self_rx.try_recv() {
            deadlines.push(run.retry_log_deadline.expect("rescheduled runs carry a deadline"));
        }
        prop_assert_eq!(deadlines.len(), burst);
        let first = deadlines[0];
        prop_assert!(
            deadlines.iter().all(|d| *d == first),
            "one error log per saturated burst"
        );
    }
}
