//! Baton Configuration System
//!
//! TOML-based configuration with environment variable override support.

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
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub redis: RedisConfig,
    pub election: ElectionSettings,
    pub node: NodeConfig,
}

/// Health and metrics HTTP server
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

/// Redis backing the shared store and the race tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every key and token; empty for none
    pub key_prefix: String,
    /// Pub/sub channel for change notifications
    pub channel: String,
    /// Race token lease in milliseconds
    pub lease_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: String::new(),
            channel: "baton:changes".to_string(),
            lease_ms: 10_000,
        }
    }
}

/// Election names and timings. Every process in a domain must agree on the names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionSettings {
    /// Derives the actor/reset race ids and heartbeat/vacant keys
    pub namespace: String,
    /// Unique identifier for this process (auto-generated if empty)
    pub instance_id: String,
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before the actor is presumed crashed
    pub missed_heartbeats: u32,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            namespace: "baton".to_string(),
            instance_id: String::new(),
            heartbeat_interval_ms: 1000,
            missed_heartbeats: 3,
            poll_interval_ms: 1000,
            settle_delay_ms: 1000,
        }
    }
}

/// What the node does once it becomes the actor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Shell command run once on becoming actor; empty to only log
    pub command: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Checks that cannot wait until the election starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.election;
        if e.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationError("election.namespace must not be empty".to_string()));
        }
        if e.heartbeat_interval_ms == 0 || e.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError("election intervals must be greater than zero".to_string()));
        }
        if e.missed_heartbeats == 0 {
            return Err(ConfigError::ValidationError("election.missed_heartbeats must be at least 1".to_string()));
        }
        let timeout_ms = e.heartbeat_interval_ms.saturating_mul(u64::from(e.missed_heartbeats));
        if e.poll_interval_ms >= timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "election.poll_interval_ms ({}) must be below the heartbeat timeout ({} ms)",
                e.poll_interval_ms, timeout_ms
            )));
        }
        if self.redis.lease_ms == 0 {
            return Err(ConfigError::ValidationError("redis.lease_ms must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Baton Configuration
# Environment variables (BATON_*) override these settings

[http]
port = 9090
host = "0.0.0.0"

[redis]
url = "redis://localhost:6379"
key_prefix = ""
channel = "baton:changes"
lease_ms = 10000

[election]
namespace = "baton"
instance_id = ""  # auto-generated when empty
heartbeat_interval_ms = 1000
missed_heartbeats = 3
poll_interval_ms = 1000
settle_delay_ms = 1000

[node]
command = ""  # run once when this node becomes the actor
"#
        .to_string()
    }
}
