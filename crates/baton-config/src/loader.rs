//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "baton.toml",
    "config.toml",
    "./config/baton.toml",
    "/etc/baton/baton.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
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

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("BATON_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("BATON_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("BATON_HTTP_HOST") {
            config.http.host = val;
        }

        // Redis
        if let Ok(val) = env::var("BATON_REDIS_URL") {
            config.redis.url = val;
        }
        if let Ok(val) = env::var("BATON_REDIS_KEY_PREFIX") {
            config.redis.key_prefix = val;
        }
        if let Ok(val) = env::var("BATON_REDIS_CHANNEL") {
            config.redis.channel = val;
        }
        if let Ok(val) = env::var("BATON_REDIS_LEASE_MS") {
            if let Ok(lease) = val.parse() {
                config.redis.lease_ms = lease;
            }
        }

        // Election
        if let Ok(val) = env::var("BATON_NAMESPACE") {
            config.election.namespace = val;
        }
        if let Ok(val) = env::var("BATON_INSTANCE_ID") {
            config.election.instance_id = val;
        }
        if let Ok(val) = env::var("BATON_HEARTBEAT_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.election.heartbeat_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("BATON_MISSED_HEARTBEATS") {
            if let Ok(missed) = val.parse() {
                config.election.missed_heartbeats = missed;
            }
        }
        if let Ok(val) = env::var("BATON_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.election.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("BATON_SETTLE_DELAY_MS") {
            if let Ok(delay) = val.parse() {
                config.election.settle_delay_ms = delay;
            }
        }

        // Node
        if let Ok(val) = env::var("BATON_NODE_COMMAND") {
            config.node.command = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
