//! Core domain objects shared across the pool, proxies and drivers.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Runtime family and version tag, e.g. `nodejs:20` or `python:3.11`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecKind(String);

impl ExecKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The runtime family, i.e. the part before the `:` separator.
    pub fn family(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ExecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container memory bound in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryMb(pub u64);

impl MemoryMb {
    pub fn bytes(&self) -> u64 {
        self.0 * 1024 * 1024
    }
}

impl fmt::Display for MemoryMb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.0)
    }
}

/// A named, versioned unit of user code with an execution kind and
/// resource limits.
///
/// Identity is `(namespace, name, revision)`: two revisions of the same
/// action are different actions for scheduling purposes. Limits are
/// carried for container sizing but excluded from equality.
#[derive(Debug, Clone)]
pub struct ExecutableAction {
    /// Namespace the action is defined in.
    pub namespace: String,
    pub name: String,
    /// Document revision of the action; bumped on every update.
    pub revision: String,
    pub kind: ExecKind,
    pub memory: MemoryMb,
    pub timeout: Duration,
}

impl ExecutableAction {
    /// Fully-qualified name for logging.
    pub fn fqn(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.revision)
    }
}

impl PartialEq for ExecutableAction {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace &&
            self.name == other.name &&
            self.revision == other.revision
    }
}

impl Eq for ExecutableAction {}

impl Hash for ExecutableAction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
        self.revision.hash(state);
    }
}

/// One invocation of an action on behalf of a tenant.
///
/// The `namespace` here is the *invoking* tenant, which may differ from
/// the action's defining namespace (shared packages); warm-container
/// reuse keys on the invoking namespace.
#[derive(Debug, Clone)]
pub struct ActivationMessage {
    pub activation_id: String,
    pub transaction_id: String,
    pub namespace: String,
    pub args: serde_json::Value,
}

/// A schedulable invocation request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub action: ExecutableAction,
    pub msg: ActivationMessage,
    /// Suppresses repeated pool-full error logs while rescheduling; set
    /// by the pool on the first saturated attempt.
    pub retry_log_deadline: Option<Instant>,
}

impl RunRequest {
    pub fn new(action: ExecutableAction, msg: ActivationMessage) -> Self {
        Self {
            action,
            msg,
            retry_log_deadline: None,
        }
    }
}

/// Identity of a container worker, shared between the pool and its proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An initialized runtime with no tenant assigned yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreWarmedData {
    pub kind: ExecKind,
    pub memory: MemoryMb,
}

/// A container that has executed at least one activation of a specific
/// action for a specific tenant, eligible for reuse by that same pair.
#[derive(Debug, Clone)]
pub struct WarmedData {
    pub kind: ExecKind,
    pub memory: MemoryMb,
    /// The invoking tenant the container is bound to.
    pub invocation_namespace: String,
    pub action: ExecutableAction,
    /// Set by the proxy at the transition to warm; read by the eviction
    /// policy. Travels with the `NeedWork` message, so no locking.
    pub last_used: Instant,
}

/// What the pool knows about a container worker.
///
/// Only advances NoData → PreWarmed → Warmed; a worker never regresses.
/// Replacement is done by destroying the worker and creating a new one.
#[derive(Debug, Clone)]
pub enum ContainerData {
    /// Slot reserved, no container yet.
    NoData,
    PreWarmed(PreWarmedData),
    Warmed(WarmedData),
}

impl ContainerData {
    pub fn kind(&self) -> Option<&ExecKind> {
        match self {
            ContainerData::NoData => None,
            ContainerData::PreWarmed(p) => Some(&p.kind),
            ContainerData::Warmed(w) => Some(&w.kind),
        }
    }

    pub fn memory(&self) -> Option<MemoryMb> {
        match self {
            ContainerData::NoData => None,
            ContainerData::PreWarmed(p) => Some(p.memory),
            ContainerData::Warmed(w) => Some(w.memory),
        }
    }
}

impl fmt::Display for ContainerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerData::NoData => write!(f, "NoData"),
            ContainerData::PreWarmed(p) => write!(f, "PreWarmed({}, {})", p.kind, p.memory),
            ContainerData::Warmed(w) => {
                write!(
                    f,
                    "Warmed({}, {}, {})",
                    w.action.fqn(),
                    w.invocation_namespace,
                    w.memory
                )
            }
        }
    }
}
