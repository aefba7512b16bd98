//! Metrics for the invoker.
//!
//! Counters for scheduling events (container starts by state, pool
//! saturation, rescheduled runs) exported over OTLP.

use anyhow::Result;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;

use crate::config::TelemetryConfig;
use crate::container_pool::types::ContainerStartState;
use crate::objects::ExecKind;

/// Initialize the OpenTelemetry metrics provider.
///
/// Sets up the global meter provider with OTLP export if metrics are
/// enabled. Must be called before any metrics are recorded.
pub fn init_provider(config: &TelemetryConfig, instance_id: &str, invoker_id: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "invoker"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("invoker.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new("invoker.id", invoker_id.to_string()))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        invoker_id = invoker_id,
        endpoint = ?config.endpoint,
        interval_secs = config.metrics_interval.as_secs(),
        "Metrics provider initialized"
    );

    Ok(())
}

/// Counters for pool scheduling events.
pub struct PoolMetrics {
    /// One mark per scheduled run, tagged with how the container was
    /// obtained (`warm`, `prewarmed`, `cold`, `recreated`).
    container_starts: Counter<u64>,
    /// Runs re-posted to the pool because no outcome existed. A
    /// rescheduled run occupies no capacity slot while in flight, so
    /// sustained growth here means the pool is undersized.
    runs_rescheduled: Counter<u64>,
    /// Pool-full error log emissions (throttled).
    pool_saturations: Counter<u64>,
    /// Prewarm containers launched (initial fill and replenishment).
    prewarm_starts: Counter<u64>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("invoker_pool");
        Self {
            container_starts: meter
                .u64_counter("invoker_container_starts")
                .with_description("Scheduled runs by container start state")
                .build(),
            runs_rescheduled: meter
                .u64_counter("invoker_runs_rescheduled")
                .with_description("Runs re-posted due to pool saturation")
                .build(),
            pool_saturations: meter
                .u64_counter("invoker_pool_saturations")
                .with_description("Throttled pool-full error log emissions")
                .build(),
            prewarm_starts: meter
                .u64_counter("invoker_prewarm_starts")
                .with_description("Prewarm containers launched")
                .build(),
        }
    }

    pub fn record_container_start(&self, state: ContainerStartState) {
        self.container_starts
            .add(1, &[KeyValue::new("container_state", state.as_str())]);
    }

    pub fn record_run_rescheduled(&self) {
        self.runs_rescheduled.add(1, &[]);
    }

    pub fn record_pool_saturation(&self) {
        self.pool_saturations.add(1, &[]);
    }

    pub fn record_prewarm_start(&self, kind: &ExecKind) {
        self.prewarm_starts
            .add(1, &[KeyValue::new("kind", kind.as_str().to_string())]);
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}
