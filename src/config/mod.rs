//! Proxy configuration.
//!
//! Loaded from an optional `config.yaml` overlaid with bare environment
//! variables (`GRPC_PORT`, `MESSAGE_BUFFER_SIZE`, ...). Durations accept
//! humantime strings such as `30s` or `100ms`.

use std::time::Duration;

use serde::Deserialize;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port for the proxy gRPC service.
    pub grpc_port: u16,
    /// Maximum concurrent gRPC streams.
    pub max_concurrent: u32,
    /// Connection read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Connection write timeout.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Producer connection pool hint for SDK-backed connectors.
    pub producer_pool_size: usize,
    /// Consumer connection pool hint for SDK-backed connectors.
    pub consumer_pool_size: usize,
    /// Capacity of each consumer's in-memory message buffer.
    pub message_buffer_size: usize,
    /// Log level forwarded to the broker SDK.
    pub rocketmq_log_level: String,

    /// Broker pull timeout, forwarded to consumer construction.
    #[serde(with = "humantime_serde")]
    pub pull_timeout: Duration,
    /// Broker pull interval, forwarded to consumer construction.
    #[serde(with = "humantime_serde")]
    pub pull_interval: Duration,

    /// Worker pool hint for SDK-backed connectors.
    pub worker_pool_size: usize,
    /// Batch size hint for SDK-backed connectors.
    pub batch_size: usize,
    /// Flush interval hint for SDK-backed connectors.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Grace period for producer teardown during shutdown.
    #[serde(with = "humantime_serde")]
    pub producer_cleanup_timeout: Duration,
    /// Grace period for consumer teardown during shutdown.
    #[serde(with = "humantime_serde")]
    pub consumer_cleanup_timeout: Duration,

    /// Whether to serve the metrics/health HTTP endpoints.
    pub enable_metrics: bool,
    /// Port for the metrics/health HTTP endpoints.
    pub metrics_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            max_concurrent: 1000,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),

            producer_pool_size: 10,
            consumer_pool_size: 20,
            message_buffer_size: 1000,
            rocketmq_log_level: "warn".to_string(),

            pull_timeout: Duration::from_secs(5),
            pull_interval: Duration::from_secs(1),

            worker_pool_size: 100,
            batch_size: 100,
            flush_interval: Duration::from_millis(100),

            producer_cleanup_timeout: Duration::from_secs(30),
            consumer_cleanup_timeout: Duration::from_secs(30),

            enable_metrics: true,
            metrics_port: 8080,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. Bare environment variables (`GRPC_PORT`, `READ_TIMEOUT`, ...)
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let config = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new("config.yaml", FileFormat::Yaml).required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let config: ProxyConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.grpc_port, 50051);
        assert_eq!(config.max_concurrent, 1000);
        assert_eq!(config.message_buffer_size, 1000);
        assert_eq!(config.pull_timeout, Duration::from_secs(5));
        assert_eq!(config.pull_interval, Duration::from_secs(1));
        assert!(config.enable_metrics);
    }

    #[test]
    fn test_config_for_test() {
        let config = ProxyConfig::for_test();
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.rocketmq_log_level, "warn");
    }
}
