//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relaybox.toml",
    "config.toml",
    "./config/relaybox.toml",
    "/etc/relaybox/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAYBOX_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("RELAYBOX_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_HTTP_HOST") {
            config.http.host = val;
        }

        // Database
        if let Ok(val) = env::var("RELAYBOX_DB_DRIVER") {
            config.database.driver = val;
        }
        if let Ok(val) = env::var("RELAYBOX_DB_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("RELAYBOX_DB_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Outbox
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_ENABLED") {
            config.outbox.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.outbox.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_RECOVERY_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.outbox.recovery_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_POLL_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.poll_batch_size = size;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_API_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.api_batch_size = size;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_MAX_IN_FLIGHT") {
            if let Ok(n) = val.parse() {
                config.outbox.max_in_flight = n;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_GLOBAL_BUFFER_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.global_buffer_size = size;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_MAX_CONCURRENT_GROUPS") {
            if let Ok(n) = val.parse() {
                config.outbox.max_concurrent_groups = n;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_PROCESSING_TIMEOUT_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.outbox.processing_timeout_seconds = secs;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_API_BASE_URL") {
            config.outbox.api_base_url = val;
        }
        if let Ok(val) = env::var("RELAYBOX_API_TOKEN") {
            config.outbox.api_token = Some(val);
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_EVENTS_TABLE") {
            config.outbox.events_table = val;
        }
        if let Ok(val) = env::var("RELAYBOX_OUTBOX_DISPATCH_JOBS_TABLE") {
            config.outbox.dispatch_jobs_table = val;
        }

        // Standby
        if let Ok(val) = env::var("RELAYBOX_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAYBOX_STANDBY_REDIS_URL") {
            config.standby.redis_url = val;
        }
        if let Ok(val) = env::var("RELAYBOX_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }
        if let Ok(val) = env::var("RELAYBOX_STANDBY_INSTANCE_ID") {
            config.standby.instance_id = val;
        }
        if let Ok(val) = env::var("RELAYBOX_STANDBY_LOCK_TTL") {
            if let Ok(ttl) = val.parse() {
                config.standby.lock_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("RELAYBOX_STANDBY_REFRESH_INTERVAL") {
            if let Ok(interval) = val.parse() {
                config.standby.refresh_interval_seconds = interval;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
