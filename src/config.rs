//! Configuration for the Scan Engine
//!
//! Policies are consumed as plain configuration: the engine never mutates them.
//! Everything can be loaded from a TOML file; logging can additionally be
//! overridden from the environment:
//!
//! - `KV_SCAN_LOG`: tracing filter directive (default: `info`)
//! - `KV_SCAN_LOG_FORMAT`: `pretty` or `json` (default: `pretty`)

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of partitions in a cluster
pub const DEFAULT_PARTITION_COUNT: u16 = 4096;

/// Cluster-wide constants injected into the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Total partition count (every key maps to exactly one partition)
    pub partition_count: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

/// Policy shared by every multi-node command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePolicy {
    /// Deadline across all rounds; zero disables it
    #[serde(with = "duration_millis")]
    pub total_timeout: Duration,
    /// Deadline for each frame read; zero disables it
    #[serde(with = "duration_millis")]
    pub socket_timeout: Duration,
    /// Rounds allowed after the first one
    pub max_retries: u32,
    /// Pause before starting a retry round
    #[serde(with = "duration_millis")]
    pub sleep_between_retries: Duration,
    /// Ask the server to compress response frames
    pub compress: bool,
}

impl Default for BasePolicy {
    fn default() -> Self {
        BasePolicy {
            total_timeout: Duration::ZERO,
            socket_timeout: Duration::from_secs(30),
            max_retries: 5,
            sleep_between_retries: Duration::from_millis(500),
            compress: false,
        }
    }
}

impl BasePolicy {
    /// Configuration for tests (short timeouts, no retry pauses)
    pub fn test() -> Self {
        BasePolicy {
            total_timeout: Duration::ZERO,
            socket_timeout: Duration::from_secs(5),
            max_retries: 5,
            sleep_between_retries: Duration::ZERO,
            compress: false,
        }
    }

    pub(crate) fn socket_timeout(&self) -> Option<Duration> {
        (!self.socket_timeout.is_zero()).then_some(self.socket_timeout)
    }

    pub(crate) fn total_timeout(&self) -> Option<Duration> {
        (!self.total_timeout.is_zero()).then_some(self.total_timeout)
    }
}

/// Policy for partition scans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    #[serde(flatten)]
    pub base: BasePolicy,
    /// Approximate cap on records returned; zero means unlimited
    pub max_records: u64,
    /// Return bin data, or only record metadata
    pub include_bin_data: bool,
    /// Capacity of the recordset channel
    pub record_queue_size: usize,
    /// Commands running in parallel per round; zero means one per node
    pub max_concurrent_nodes: usize,
    /// Finish once only unavailable partitions remain instead of retrying them
    pub allow_partial: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        ScanPolicy {
            base: BasePolicy::default(),
            max_records: 0,
            include_bin_data: true,
            record_queue_size: 5000,
            max_concurrent_nodes: 0,
            allow_partial: false,
        }
    }
}

impl ScanPolicy {
    /// Configuration for tests (small queue, fast retries)
    pub fn test() -> Self {
        ScanPolicy {
            base: BasePolicy::test(),
            max_records: 0,
            include_bin_data: true,
            record_queue_size: 64,
            max_concurrent_nodes: 0,
            allow_partial: false,
        }
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections checked out at once, across all nodes
    pub max_connections: usize,
    /// Idle connections kept per node
    pub idle_per_node: usize,
    /// Encode buffers kept for reuse
    pub buffer_pool_size: usize,
    /// Capacity of each pooled encode buffer
    pub buffer_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 256,
            idle_per_node: 16,
            buffer_pool_size: 64,
            buffer_capacity: 8192,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `kv_scan=debug`
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Apply `KV_SCAN_LOG` / `KV_SCAN_LOG_FORMAT` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = std::env::var("KV_SCAN_LOG") {
            if !filter.is_empty() {
                self.filter = filter;
            }
        }
        if let Ok(format) = std::env::var("KV_SCAN_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "json" => self.format = LogFormat::Json,
                "pretty" => self.format = LogFormat::Pretty,
                _ => {}
            }
        }
        self
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub scan: ScanPolicy,
    pub pool: PoolConfig,
    pub log: LogConfig,
}

impl EngineConfig {
    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "cluster.partition_count must be positive".to_string(),
            ));
        }
        if self.scan.record_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "scan.record_queue_size must be positive".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cluster.partition_count, 4096);
        assert_eq!(config.scan.max_records, 0);
        assert_eq!(config.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [cluster]
            partition_count = 256

            [scan]
            max_retries = 2
            socket_timeout = 1500
            max_records = 1000

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.partition_count, 256);
        assert_eq!(config.scan.base.max_retries, 2);
        assert_eq!(config.scan.base.socket_timeout, Duration::from_millis(1500));
        assert_eq!(config.scan.max_records, 1000);
        assert_eq!(config.scan.record_queue_size, 5000);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_partition_count_rejected() {
        let err = EngineConfig::from_toml_str("[cluster]\npartition_count = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        let err = EngineConfig::from_toml_str("[scan\nmax_retries = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_disabled_timeouts() {
        let mut policy = BasePolicy::test();
        policy.socket_timeout = Duration::ZERO;
        assert_eq!(policy.socket_timeout(), None);
        assert_eq!(policy.total_timeout(), None);
    }
}
