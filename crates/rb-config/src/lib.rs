//! Relaybox configuration.
//!
//! TOML files with environment variable overrides. Every section has
//! working defaults so the dispatcher runs with no config file at all.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub outbox: OutboxSettings,
    pub standby: StandbySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            outbox: OutboxSettings::default(),
            standby: StandbySettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox.poll_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.poll_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.outbox.api_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.api_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.outbox.global_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.global_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.outbox.max_concurrent_groups == 0 {
            return Err(ConfigError::ValidationError(
                "outbox.max_concurrent_groups must be greater than zero".to_string(),
            ));
        }
        if self.outbox.max_in_flight < self.outbox.poll_batch_size as u64 {
            return Err(ConfigError::ValidationError(
                "outbox.max_in_flight must be at least outbox.poll_batch_size".to_string(),
            ));
        }
        if self.standby.enabled {
            // The lease must survive two missed refreshes before it expires.
            if self.standby.refresh_interval_seconds * 2 >= self.standby.lock_ttl_seconds {
                return Err(ConfigError::ValidationError(
                    "standby.refresh_interval_seconds must be strictly less than half of standby.lock_ttl_seconds"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration (health and metrics endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Outbox database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database driver: `sqlite` or `postgres`
    pub driver: String,
    /// Connection URL
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            url: "sqlite://relaybox.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Outbox dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Master switch for the dispatcher
    pub enabled: bool,
    /// Poll tick interval in milliseconds
    pub poll_interval_ms: u64,
    /// Recovery tick interval in milliseconds
    pub recovery_interval_ms: u64,
    /// Rows fetched per poll, per item type
    pub poll_batch_size: u32,
    /// Maximum items per API call
    pub api_batch_size: usize,
    /// How long a group worker waits for more items before dispatching a
    /// partial batch, in milliseconds
    pub batch_linger_ms: u64,
    /// Backpressure ceiling: items accepted into the pipeline but not yet
    /// terminally written
    pub max_in_flight: u64,
    /// Global buffer capacity between the poller and the distributor
    pub global_buffer_size: usize,
    /// Permits in the global semaphore capping concurrent API calls
    pub max_concurrent_groups: usize,
    /// Per-group queue capacity
    pub group_queue_capacity: usize,
    /// Age after which a non-success row is rewound to PENDING, in seconds
    pub processing_timeout_seconds: u64,
    /// Base URL of the batch API
    pub api_base_url: String,
    /// Optional Bearer token for the batch API
    pub api_token: Option<String>,
    /// HTTP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Table holding EVENT rows
    pub events_table: String,
    /// Table holding DISPATCH_JOB rows
    pub dispatch_jobs_table: String,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            recovery_interval_ms: 60_000,
            poll_batch_size: 100,
            api_batch_size: 100,
            batch_linger_ms: 25,
            max_in_flight: 1000,
            global_buffer_size: 2000,
            max_concurrent_groups: 50,
            group_queue_capacity: 1000,
            processing_timeout_seconds: 300,
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            events_table: "outbox_events".to_string(),
            dispatch_jobs_table: "outbox_dispatch_jobs".to_string(),
        }
    }
}

/// Standby / leader election settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbySettings {
    /// Enable leader election (requires Redis). When disabled the instance
    /// always acts as primary.
    pub enabled: bool,
    /// Redis URL for the leader lock
    pub redis_url: String,
    /// Leader lock key
    pub lock_key: String,
    /// Unique identifier for this instance
    pub instance_id: String,
    /// Lock TTL in seconds
    pub lock_ttl_seconds: u64,
    /// Refresh interval in seconds (must be strictly less than TTL/2)
    pub refresh_interval_seconds: u64,
}

impl Default for StandbySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relaybox:outbox:leader".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            lock_ttl_seconds: 30,
            refresh_interval_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.outbox.poll_interval_ms, 1000);
        assert_eq!(config.outbox.poll_batch_size, 100);
        assert_eq!(config.outbox.max_in_flight, 1000);
        assert_eq!(config.outbox.global_buffer_size, 2000);
        assert_eq!(config.outbox.max_concurrent_groups, 50);
        assert_eq!(config.outbox.processing_timeout_seconds, 300);
        assert_eq!(config.standby.lock_key, "relaybox:outbox:leader");
    }

    #[test]
    fn parses_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [outbox]
            poll_batch_size = 25
            api_base_url = "https://api.example.com"

            [database]
            driver = "postgres"
            url = "postgres://localhost/outbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.outbox.poll_batch_size, 25);
        assert_eq!(config.outbox.api_base_url, "https://api.example.com");
        assert_eq!(config.database.driver, "postgres");
        // Untouched sections keep their defaults.
        assert_eq!(config.outbox.recovery_interval_ms, 60_000);
    }

    #[test]
    fn rejects_refresh_interval_at_half_ttl() {
        let mut config = AppConfig::default();
        config.standby.enabled = true;
        config.standby.lock_ttl_seconds = 20;
        config.standby.refresh_interval_seconds = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.standby.refresh_interval_seconds = 9;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.outbox.poll_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_max_in_flight_below_batch() {
        let mut config = AppConfig::default();
        config.outbox.max_in_flight = 10;
        config.outbox.poll_batch_size = 100;
        assert!(config.validate().is_err());
    }
}
