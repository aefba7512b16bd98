//! Pure scheduling decisions over pool map snapshots.
//!
//! Warm-container locality dominates cost, so reuse wins over prewarm
//! and prewarm wins over cold. Eviction picks the least-recently-used
//! warm container only; evicting a prewarm would defeat its purpose.

use std::collections::HashMap;

use super::types::Worker;
use crate::objects::{ContainerData, ContainerId, ExecutableAction};

/// Find a free worker warmed for exactly this `(action, namespace)`
/// pair. Action equality is structural and includes the revision.
/// Ties are broken arbitrarily.
pub fn schedule<'a>(
    action: &ExecutableAction,
    namespace: &str,
    free: &'a HashMap<ContainerId, Worker>,
) -> Option<&'a ContainerId> {
    free.iter()
        .find(|(_, worker)| match &worker.data {
            ContainerData::Warmed(w) => {
                w.invocation_namespace == namespace && &w.action == action
            }
            _ => false,
        })
        .map(|(id, _)| id)
}

/// Pick the eviction victim: the free worker in `Warmed` state with the
/// minimum `last_used` instant. Returns `None` when no free worker is
/// warm (`NoData` and `PreWarmed` workers are never evicted this way).
pub fn find_oldest_warm(free: &HashMap<ContainerId, Worker>) -> Option<&ContainerId> {
    free.iter()
        .filter_map(|(id, worker)| match &worker.data {
            ContainerData::Warmed(w) => Some((id, w.last_used)),
            _ => None,
        })
        .min_by_key(|(_, last_used)| *last_used)
        .map(|(id, _)| id)
}
