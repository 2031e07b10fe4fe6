//! Configuration surface of the gateway.
//!
//! The deployment's configuration loader hands these structs in at
//! construction; they also deserialize directly from the JSON config file
//! the bus has always shipped with (`config.json`). Every field has a
//! default, so a minimal deployment can start from `GatewayConfig::default()`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::outbox::OverflowPolicy;
use crate::routing::DEFAULT_EXCHANGE;

/// Outbox buffer tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Global capacity ceiling, counting queued plus in-flight tasks.
    pub capacity: usize,
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    pub overflow: OverflowPolicy,
    pub retry_backoff: BackoffConfig,
    /// Spool directory; required for the spill-to-disk policy, optional
    /// otherwise (shutdown can still persist the flush remainder there).
    pub spill_dir: Option<PathBuf>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_attempts: 10,
            overflow: OverflowPolicy::RejectNew,
            retry_backoff: BackoffConfig {
                base_delay_ms: 100,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
            spill_dir: None,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Producer name stamped into every envelope's meta.
    pub producer: String,
    /// Topic exchange events are published to.
    pub exchange: String,
    pub confirm_timeout_ms: u64,
    /// Drain worker sleep when the buffer has nothing eligible.
    pub poll_interval_ms: u64,
    /// How long graceful shutdown waits for the buffer to flush.
    pub shutdown_flush_ms: u64,
    pub reconnect_backoff: BackoffConfig,
    pub outbox: OutboxConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            producer: "tolling-gateway".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            confirm_timeout_ms: 5_000,
            poll_interval_ms: 25,
            shutdown_flush_ms: 5_000,
            reconnect_backoff: BackoffConfig {
                base_delay_ms: 200,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
            outbox: OutboxConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = fs::read(path.as_ref()).map_err(ConfigError::Io)?;
        serde_json::from_slice(&bytes).map_err(ConfigError::Parse)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_flush(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_ms)
    }
}

/// Failure loading or parsing a config file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "failed to parse config file: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = GatewayConfig::default();
        assert_eq!(config.producer, "tolling-gateway");
        assert_eq!(config.exchange, "tolling.events");
        assert_eq!(config.outbox.capacity, 1024);
        assert_eq!(config.outbox.overflow, OverflowPolicy::RejectNew);
        assert_eq!(config.outbox.max_attempts, 10);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "producer": "module3",
                "outbox": { "capacity": 64, "overflow": "evict-oldest" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.producer, "module3");
        assert_eq!(config.exchange, "tolling.events");
        assert_eq!(config.outbox.capacity, 64);
        assert_eq!(config.outbox.overflow, OverflowPolicy::EvictOldest);
        assert_eq!(config.outbox.max_attempts, 10);
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = GatewayConfig::default();
        config.outbox.overflow = OverflowPolicy::SpillToDisk;
        config.outbox.spill_dir = Some(dir.path().join("spool"));
        fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();

        let loaded = GatewayConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = GatewayConfig::from_json_file("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
