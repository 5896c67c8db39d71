//! Configuration types for the ingestion service.

use std::net::SocketAddr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use vantage_broker::{BrokerConfig, FanoutConfig, StreamConfig};

use crate::IngestError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default status API port.
pub const DEFAULT_STATUS_PORT: u16 = 3200;

/// Default maximum entries handled per read cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time a read waits for new entries on an empty stream.
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1_000;

/// Default backoff after the first failed read.
pub const DEFAULT_BACKOFF_FLOOR_MS: u64 = 1_000;

/// Default upper bound for read backoff.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// Default pause before a panicked processor is restarted.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 5_000;

/// Default prefix for per-kind stream names.
pub const DEFAULT_STREAM_PREFIX: &str = "vantage:ingest";

/// Default Postgres connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Ingestion service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Status server configuration.
    pub server: ServerConfig,
    /// Broker backends and stream naming.
    pub broker: QueueConfig,
    /// Time-series storage backend.
    pub storage: StorageConfig,
    /// Stream processor tuning.
    pub processor: ProcessorConfig,
}

impl IngestConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `ingest.toml` in current directory
    /// 3. Environment variables prefixed with `VANTAGE_` (nested keys
    ///    separated by `__`, e.g. `VANTAGE_PROCESSOR__BATCH_SIZE`)
    pub fn load() -> Result<Self, IngestError> {
        Self::load_from("ingest.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, IngestError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VANTAGE_").split("__"))
            .extract()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the processors cannot run with.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.processor.batch_size == 0 {
            return Err(IngestError::Config(
                "processor.batch_size must be at least 1".to_owned(),
            ));
        }
        if self.processor.backoff_floor_ms == 0 {
            return Err(IngestError::Config(
                "processor.backoff_floor_ms must be at least 1".to_owned(),
            ));
        }
        if self.processor.backoff_floor_ms > self.processor.backoff_cap_ms {
            return Err(IngestError::Config(format!(
                "processor.backoff_floor_ms ({}) exceeds processor.backoff_cap_ms ({})",
                self.processor.backoff_floor_ms, self.processor.backoff_cap_ms
            )));
        }
        if self.broker.stream_prefix.is_empty() {
            return Err(IngestError::Config(
                "broker.stream_prefix must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Status server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Status API address (default: 0.0.0.0:3200).
    pub status_addr: SocketAddr,
    /// Serve Prometheus metrics on `/metrics`.
    pub prometheus: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            status_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_STATUS_PORT)),
            prometheus: true,
        }
    }
}

/// Queue configuration: broker backends plus stream naming.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Durable stream backend.
    pub stream: StreamConfig,
    /// Live fan-out backend.
    pub fanout: FanoutConfig,
    /// Streams are named `{stream_prefix}:{kind}`.
    pub stream_prefix: String,
}

impl QueueConfig {
    /// Backend selection in the shape the broker provider expects.
    pub fn backends(&self) -> BrokerConfig {
        BrokerConfig {
            stream: self.stream.clone(),
            fanout: self.fanout.clone(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            fanout: FanoutConfig::default(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_owned(),
        }
    }
}

/// Time-series storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for testing and local development).
    #[default]
    Memory,
    /// PostgreSQL / TimescaleDB.
    Postgres {
        /// Connection URL, e.g. `postgres://vantage@localhost/telemetry`.
        url: String,
        /// Connection pool size.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

const fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

/// Stream processor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum entries handled per read cycle.
    pub batch_size: usize,
    /// How long a read waits on an empty stream, in milliseconds.
    pub block_timeout_ms: u64,
    /// First backoff after a failed read, in milliseconds.
    ///
    /// Doubles after each consecutive failure up to `backoff_cap_ms`, and
    /// resets after any successful read.
    pub backoff_floor_ms: u64,
    /// Maximum read backoff in milliseconds.
    pub backoff_cap_ms: u64,
    /// Pause before a panicked processor is restarted, in milliseconds.
    pub restart_delay_ms: u64,
}

impl ProcessorConfig {
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub const fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms)
    }

    pub const fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            backoff_floor_ms: DEFAULT_BACKOFF_FLOOR_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.server.status_addr.port(), DEFAULT_STATUS_PORT);
        assert_eq!(config.broker.stream_prefix, DEFAULT_STREAM_PREFIX);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn processor_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.block_timeout(), Duration::from_secs(1));
        assert_eq!(config.backoff_floor(), Duration::from_secs(1));
        assert_eq!(config.backoff_cap(), Duration::from_secs(60));
        assert_eq!(config.restart_delay(), Duration::from_secs(5));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = IngestConfig::default();
        config.processor.batch_size = 0;
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn floor_above_cap_rejected() {
        let mut config = IngestConfig::default();
        config.processor.backoff_floor_ms = 120_000;
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn toml_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "ingest.toml",
                r#"
                [processor]
                batch_size = 250

                [storage]
                type = "postgres"
                url = "postgres://localhost/telemetry"

                [broker.stream]
                backend = "valkey"
                url = "redis://127.0.0.1:6379"
                "#,
            )?;
            jail.set_env("VANTAGE_PROCESSOR__RESTART_DELAY_MS", "250");

            let config = IngestConfig::load().expect("config should load");
            assert_eq!(config.processor.batch_size, 250);
            assert_eq!(config.processor.restart_delay_ms, 250);
            assert_eq!(config.processor.block_timeout_ms, DEFAULT_BLOCK_TIMEOUT_MS);
            match config.storage {
                StorageConfig::Postgres {
                    url,
                    max_connections,
                } => {
                    assert_eq!(url, "postgres://localhost/telemetry");
                    assert_eq!(max_connections, DEFAULT_MAX_CONNECTIONS);
                }
                StorageConfig::Memory => panic!("Expected postgres storage"),
            }
            assert!(matches!(
                config.broker.backends().stream,
                StreamConfig::Valkey { .. }
            ));
            Ok(())
        });
    }
}
