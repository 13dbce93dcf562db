//! Election configuration

use std::time::Duration;

use uuid::Uuid;

use crate::error::{ElectionError, Result};

/// Names and timings shared by every process in one coordination domain.
///
/// The four names are the entire persisted layout; processes running
/// different versions must agree on them.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Race id whose holder is the actor
    pub actor_race_id: String,

    /// Race id serializing crash recovery
    pub reset_race_id: String,

    /// Store key holding the actor's last heartbeat (epoch millis)
    pub heartbeat_key: String,

    /// Store key set by an actor as its last act before exiting cleanly
    pub vacant_key: String,

    /// How often the actor refreshes its heartbeat
    pub heartbeat_interval: Duration,

    /// Heartbeats a candidate tolerates missing before presuming a crash
    pub missed_heartbeats: u32,

    /// How often candidates inspect the heartbeat (must be below the timeout)
    pub poll_interval: Duration,

    /// How long a recovering process keeps the reset token after taking over
    pub settle_delay: Duration,

    /// Unique identifier for this process
    pub instance_id: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            actor_race_id: "baton:actor".to_string(),
            reset_race_id: "baton:reset".to_string(),
            heartbeat_key: "baton:heartbeat".to_string(),
            vacant_key: "baton:vacant".to_string(),
            heartbeat_interval: Duration::from_millis(1000),
            missed_heartbeats: 3,
            poll_interval: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(1000),
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl ElectionConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Derive all four names from one namespace, e.g. `jobs` -> `jobs:actor`
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.actor_race_id = format!("{}:actor", namespace);
        self.reset_race_id = format!("{}:reset", namespace);
        self.heartbeat_key = format!("{}:heartbeat", namespace);
        self.vacant_key = format!("{}:vacant", namespace);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_missed_heartbeats(mut self, missed: u32) -> Self {
        self.missed_heartbeats = missed;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Heartbeat age beyond which the actor is presumed crashed
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }

    /// Worst-case delay between the last heartbeat of a crashed actor and a
    /// survivor finishing its takeover
    pub fn recovery_bound(&self) -> Duration {
        self.heartbeat_timeout() + self.poll_interval + self.settle_delay
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ElectionError::Config(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ElectionError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(ElectionError::Config(
                "missed_heartbeats must be at least 1".to_string(),
            ));
        }
        if self.poll_interval >= self.heartbeat_timeout() {
            return Err(ElectionError::Config(format!(
                "poll_interval ({:?}) must be shorter than the heartbeat timeout ({:?})",
                self.poll_interval,
                self.heartbeat_timeout()
            )));
        }

        let names = [
            ("actor_race_id", &self.actor_race_id),
            ("reset_race_id", &self.reset_race_id),
            ("heartbeat_key", &self.heartbeat_key),
            ("vacant_key", &self.vacant_key),
            ("instance_id", &self.instance_id),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ElectionError::Config(format!("{} must not be empty", field)));
            }
        }
        if self.actor_race_id == self.reset_race_id {
            return Err(ElectionError::Config(
                "actor_race_id and reset_race_id must differ".to_string(),
            ));
        }
        if self.heartbeat_key == self.vacant_key {
            return Err(ElectionError::Config(
                "heartbeat_key and vacant_key must differ".to_string(),
            ));
        }

        Ok(())
    }
}
