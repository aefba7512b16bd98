//! State types for the container pool.

use std::fmt;

use crate::container_proxy::ProxyHandle;
use crate::objects::ContainerData;

/// A container worker tracked by the pool: its proxy mailbox plus the
/// last data snapshot the proxy reported.
pub struct Worker {
    pub proxy: ProxyHandle,
    pub data: ContainerData,
}

impl Worker {
    pub fn new(proxy: ProxyHandle, data: ContainerData) -> Self {
        Self { proxy, data }
    }
}

/// How a scheduled run obtained its container. Tags the
/// `container_start` observability mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStartState {
    /// Reused a free container warmed for the same `(action, tenant)`.
    Warm,
    /// Promoted a prewarmed container of the matching `(kind, memory)`.
    Prewarmed,
    /// Created a fresh container under capacity.
    Cold,
    /// Evicted the oldest warm container to make room. The tag stays
    /// `recreated` even when no prewarm matched and a fresh container
    /// was created on the freed slot.
    Recreated,
}

impl ContainerStartState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStartState::Warm => "warm",
            ContainerStartState::Prewarmed => "prewarmed",
            ContainerStartState::Cold => "cold",
            ContainerStartState::Recreated => "recreated",
        }
    }
}

impl fmt::Display for ContainerStartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
