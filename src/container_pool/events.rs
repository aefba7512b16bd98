//! Messages into and out of the container pool.

use crate::container_proxy::ProxyHandle;
use crate::objects::{ContainerData, ContainerId, RunRequest};

/// Messages the pool supervisor consumes, from the feed, from container
/// proxies, and from itself (rescheduled runs).
pub enum PoolMsg {
    /// Admit, schedule, or reschedule an invocation.
    Run(RunRequest),
    /// A proxy reports it is ready for work: prewarmed after
    /// initialization, or warm-and-idle after finishing a job. Carries
    /// the sender's handle so freshly prewarmed workers can be adopted.
    NeedWork {
        worker: ProxyHandle,
        data: ContainerData,
    },
    /// A proxy has terminated its container.
    ContainerRemoved { id: ContainerId },
    /// A proxy could not execute its assigned job; the job has already
    /// been re-posted by the proxy and the worker is self-destructing.
    RescheduleJob { id: ContainerId },
    /// Graceful drain: send `Remove` to every worker and stop.
    Shutdown,
}

/// Acknowledgments to the upstream message feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSignal {
    /// One slot of active capacity was freed: a busy container finished
    /// its job or was removed mid-flight.
    Processed,
}
