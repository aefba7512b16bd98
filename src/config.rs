use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

use crate::container_proxy::ProxyConfig;
use crate::objects::{ExecKind, MemoryMb};

const LOCAL_ENV: &str = "local";
const DEFAULT_MAX_ACTIVE_CONTAINERS: usize = 8;
const DEFAULT_LOG_MESSAGE_INTERVAL_SECS: u64 = 10;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;

/// One prewarm population entry: keep `count` containers of this
/// `(kind, memory)` initialized and ready to claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmEntry {
    pub count: u32,
    pub kind: ExecKind,
    #[serde(rename = "memory_mb")]
    pub memory: MemoryMb,
}

/// Configuration for the container pool scheduler.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard cap on `|busy| + |free|` containers. Prewarmed containers
    /// are not counted.
    #[serde_inline_default(DEFAULT_MAX_ACTIVE_CONTAINERS)]
    pub max_active_containers: usize,
    /// Prewarm population, kept filled for cold-start amortization.
    #[serde(default)]
    pub prewarm: Vec<PrewarmEntry>,
    /// Pool-full error logs are emitted at most once per interval.
    #[serde_inline_default(Duration::from_secs(DEFAULT_LOG_MESSAGE_INTERVAL_SECS))]
    #[serde(with = "duration_secs_serde")]
    pub log_message_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active_containers: DEFAULT_MAX_ACTIVE_CONTAINERS,
            prewarm: Vec::new(),
            log_message_interval: Duration::from_secs(DEFAULT_LOG_MESSAGE_INTERVAL_SECS),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_active_containers == 0 {
            return Err(anyhow::anyhow!(
                "pool.max_active_containers must be at least 1"
            ));
        }
        for entry in &self.prewarm {
            if entry.count == 0 {
                return Err(anyhow::anyhow!(
                    "pool.prewarm entries must have count >= 1, got 0 for kind {}",
                    entry.kind
                ));
            }
            if entry.kind.as_str().is_empty() {
                return Err(anyhow::anyhow!("pool.prewarm entries must name a kind"));
            }
            if entry.memory.0 == 0 {
                return Err(anyhow::anyhow!(
                    "pool.prewarm entries must have memory_mb > 0 for kind {}",
                    entry.kind
                ));
            }
        }
        Ok(())
    }
}

/// Per-container proxy timing knobs.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Idle containers are destroyed after this many seconds.
    #[serde_inline_default(600)]
    pub idle_timeout_secs: u64,
    /// Warm containers are paused after this many milliseconds idle.
    #[serde_inline_default(50)]
    pub pause_grace_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            pause_grace_ms: 50,
        }
    }
}

impl ProxySettings {
    pub fn to_proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            pause_grace: Duration::from_millis(self.pause_grace_ms),
        }
    }
}

/// Container runtime driver selection.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriverConfig {
    /// Run action runtimes as local subprocesses.
    ForkExec {
        #[serde(default = "default_runtime_dir")]
        runtime_dir: String,
        #[serde(default = "default_work_dir")]
        work_dir: String,
    },
    /// Run action runtimes as Docker containers.
    Docker {
        /// Docker daemon address. Supports unix sockets and http/tcp
        /// addresses; uses Docker's default socket when unset.
        #[serde(default)]
        address: Option<String>,
        #[serde(default = "default_image_prefix")]
        image_prefix: String,
    },
}

fn default_runtime_dir() -> String {
    "/opt/invoker/runtimes".to_string()
}

fn default_work_dir() -> String {
    "/tmp/invoker".to_string()
}

fn default_image_prefix() -> String {
    "invoker".to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::ForkExec {
            runtime_dir: default_runtime_dir(),
            work_dir: default_work_dir(),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OpenTelemetry collector grpc endpoint for metrics. Defaults to
    /// the OTEL_EXPORTER_OTLP_ENDPOINT env var or localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Metrics export interval in seconds.
    #[serde_inline_default(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS))]
    #[serde(with = "duration_secs_serde")]
    pub metrics_interval: Duration,
    /// Instance ID for this invoker instance.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            instance_id: None,
        }
    }
}

mod duration_secs_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

/// Configuration for the invoker service.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Environment name (e.g., "local", "staging", "production").
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    /// Unique identifier for this invoker.
    #[serde(default = "default_invoker_id")]
    pub invoker_id: String,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_invoker_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for InvokerConfig {
    fn default() -> Self {
        InvokerConfig {
            env: LOCAL_ENV.to_string(),
            invoker_id: default_invoker_id(),
            pool: PoolConfig::default(),
            proxy: ProxySettings::default(),
            driver: DriverConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl InvokerConfig {
    pub fn from_path(path: &str) -> Result<InvokerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<InvokerConfig> {
        let config: InvokerConfig = serde_saphyr::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("invoker-{}-{}", self.env, Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InvokerConfig::default();
        assert_eq!(config.env, "local");
        assert_eq!(config.pool.max_active_containers, 8);
        assert_eq!(config.pool.log_message_interval, Duration::from_secs(10));
        assert!(config.pool.prewarm.is_empty());
        assert!(config.validate().is_ok());
        assert!(!config.structured_logging());
    }

    #[test]
    fn test_parse_pool_config() {
        let yaml = r#"
env: production
pool:
  max_active_containers: 16
  log_message_interval: 5
  prewarm:
    - count: 2
      kind: "nodejs:20"
      memory_mb: 256
    - count: 1
      kind: "python:3.11"
      memory_mb: 512
"#;
        let config = InvokerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pool.max_active_containers, 16);
        assert_eq!(config.pool.log_message_interval, Duration::from_secs(5));
        assert_eq!(config.pool.prewarm.len(), 2);
        assert_eq!(config.pool.prewarm[0].count, 2);
        assert_eq!(config.pool.prewarm[0].kind.as_str(), "nodejs:20");
        assert_eq!(config.pool.prewarm[1].memory, MemoryMb(512));
        assert!(config.structured_logging());
    }

    #[test]
    fn test_zero_max_active_containers_is_fatal() {
        let yaml = r#"
env: local
pool:
  max_active_containers: 0
"#;
        let result = InvokerConfig::from_yaml_str(yaml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_active_containers"));
    }

    #[test]
    fn test_zero_count_prewarm_entry_is_fatal() {
        let yaml = r#"
env: local
pool:
  prewarm:
    - count: 0
      kind: "nodejs:20"
      memory_mb: 256
"#;
        let result = InvokerConfig::from_yaml_str(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("count >= 1"));
    }

    #[test]
    fn test_zero_memory_prewarm_entry_is_fatal() {
        let yaml = r#"
env: local
pool:
  prewarm:
    - count: 1
      kind: "nodejs:20"
      memory_mb: 0
"#;
        assert!(InvokerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_parse_docker_driver() {
        let yaml = r#"
env: local
driver:
  type: docker
  address: "unix:///var/run/docker.sock"
  image_prefix: "ghcr.io/acme"
"#;
        let config = InvokerConfig::from_yaml_str(yaml).unwrap();
        match config.driver {
            DriverConfig::Docker {
                address,
                image_prefix,
            } => {
                assert_eq!(address.as_deref(), Some("unix:///var/run/docker.sock"));
                assert_eq!(image_prefix, "ghcr.io/acme");
            }
            _ => panic!("expected docker driver"),
        }
    }

    #[test]
    fn test_fork_exec_driver_defaults() {
        let config = InvokerConfig::default();
        match config.driver {
            DriverConfig::ForkExec {
                runtime_dir,
                work_dir,
            } => {
                assert_eq!(runtime_dir, "/opt/invoker/runtimes");
                assert_eq!(work_dir, "/tmp/invoker");
            }
            _ => panic!("expected fork_exec driver"),
        }
    }

    #[test]
    fn test_proxy_settings_conversion() {
        let settings = ProxySettings {
            idle_timeout_secs: 300,
            pause_grace_ms: 100,
        };
        let proxy_config = settings.to_proxy_config();
        assert_eq!(proxy_config.idle_timeout, Duration::from_secs(300));
        assert_eq!(proxy_config.pause_grace, Duration::from_millis(100));
    }
}
