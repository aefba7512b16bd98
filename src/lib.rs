//! Invoker container pool library.
//!
//! The worker-node side of a serverless platform: schedules each
//! incoming action invocation onto a runtime container, keeps a
//! prewarmed population for cold-start amortization, evicts
//! least-recently-used warm containers under memory pressure, and
//! applies backpressure to the upstream message feed.

pub mod config;
pub mod container_pool;
pub mod container_proxy;
pub mod driver;
pub mod feed;
pub mod metrics;
pub mod objects;
pub mod service;
pub mod tracing;

// Re-export key types for convenience
pub use container_pool::{ContainerPool, ContainerPoolHandle};
pub use container_proxy::{ContainerFactory, ProxyConfig, ProxyFactory, ProxyHandle, ProxyMsg};
pub use driver::{ContainerDriver, DockerDriver, ForkExecDriver, RunError, RuntimeContainer};
pub use feed::MessageFeed;
pub use metrics::PoolMetrics;

#[cfg(test)]
mod pool_invariants_test;
