//! Redis-backed collaborators
//!
//! - `RedisStore`: plain keys, with every write announced on a pub/sub
//!   channel so other processes see it
//! - `RedisRace`: SET NX tokens with a lease that the holder keeps extending,
//!   so a token whose holder died expires on its own

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ElectionError, Result};
use crate::race::RacePrimitive;
use crate::store::{ChangeEvent, SharedStore, Subscription};

const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

/// Connection settings shared by the Redis store and race
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Prepended (with `:`) to every key and token; empty for none
    pub key_prefix: String,

    /// Pub/sub channel carrying change announcements
    pub channel: String,

    /// Token lease; the holder renews it every third of the lease
    pub lease: Duration,

    /// Identifies this process as writer and token holder
    pub instance_id: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            channel: "baton:changes".to_string(),
            lease: Duration::from_secs(10),
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl RedisBackendConfig {
    pub fn new(redis_url: String) -> Self {
        Self {
            redis_url,
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: String) -> Self {
        self.key_prefix = prefix;
        self
    }

    pub fn with_channel(mut self, channel: String) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_instance_id(mut self, id: String) -> Self {
        self.instance_id = id;
        self
    }

    fn key(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.key_prefix, name)
        }
    }

    fn lease_millis(&self) -> u64 {
        self.lease.as_millis().max(1) as u64
    }
}

/// Wire format of a change announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    origin: String,
    key: String,
    value: Option<String>,
}

impl Envelope {
    /// The change, unless it was written by `origin` itself
    fn into_foreign_event(self, origin: &str) -> Option<ChangeEvent> {
        if self.origin == origin {
            return None;
        }
        Some(ChangeEvent {
            key: self.key,
            value: self.value,
        })
    }
}

pub struct RedisStore {
    client: ::redis::Client,
    conn: ConnectionManager,
    config: RedisBackendConfig,
}

impl RedisStore {
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.redis_url.as_str())
            .map_err(|e| ElectionError::Store(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(
            instance_id = %config.instance_id,
            channel = %config.channel,
            "Connected Redis store"
        );

        Ok(Self {
            client,
            conn,
            config,
        })
    }

    async fn announce(&self, key: &str, value: Option<&str>) -> Result<()> {
        let envelope = Envelope {
            origin: self.config.instance_id.clone(),
            key: key.to_string(),
            value: value.map(str::to_string),
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.config.channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.config.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.config.key(key), value).await?;
        self.announce(key, Some(value)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.config.key(key)).await?;
        if removed > 0 {
            self.announce(key, None).await?;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.config.channel).await?;

        let origin = self.config.instance_id.clone();
        let channel = self.config.channel.clone();
        let (tx, events) = mpsc::unbounded_channel();

        let feed = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();

            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Unreadable change announcement");
                        continue;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Malformed change announcement");
                        continue;
                    }
                };

                if let Some(event) = envelope.into_foreign_event(&origin) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }

            debug!(channel = %channel, "Redis change feed closed");
        });

        Ok(Subscription::new(events, feed))
    }
}

pub struct RedisRace {
    client: ::redis::Client,
    conn: ConnectionManager,
    config: RedisBackendConfig,
    renewals: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RedisRace {
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.redis_url.as_str())
            .map_err(|e| ElectionError::Race(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            config,
            renewals: Mutex::new(HashMap::new()),
        })
    }

    /// Keep extending the lease while we hold the token
    fn spawn_renewal(&self, key: String) -> JoinHandle<()> {
        let mut conn = self.conn.clone();
        let holder = self.config.instance_id.clone();
        let lease_ms = self.config.lease_millis();
        let period = (self.config.lease / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;

                let result = ::redis::Script::new(RENEW_SCRIPT)
                    .key(&key)
                    .arg(&holder)
                    .arg(lease_ms)
                    .invoke_async::<i32>(&mut conn)
                    .await;

                match result {
                    Ok(1) => debug!(race_id = %key, "Extended race token lease"),
                    Ok(_) => {
                        warn!(race_id = %key, instance_id = %holder, "Race token lost; lease expired");
                        break;
                    }
                    Err(e) => warn!(race_id = %key, error = %e, "Failed to extend race token lease"),
                }
            }
        })
    }
}

#[async_trait]
impl RacePrimitive for RedisRace {
    async fn race(&self, id: &str) -> Result<bool> {
        let key = self.config.key(id);
        let mut conn = self.conn.clone();

        // SET key value NX PX millis
        let acquired: Option<String> = ::redis::cmd("SET")
            .arg(&key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("PX")
            .arg(self.config.lease_millis())
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            return Ok(false);
        }

        let renewal = self.spawn_renewal(key);
        if let Some(previous) = self.renewals.lock().insert(id.to_string(), renewal) {
            previous.abort();
        }
        Ok(true)
    }

    fn end_race(&self, id: &str) {
        if let Some(renewal) = self.renewals.lock().remove(id) {
            renewal.abort();
        }

        // Blocking connection: this must finish even while the runtime winds down
        let key = self.config.key(id);
        let result = self.client.get_connection().and_then(|mut conn| {
            ::redis::Script::new(RELEASE_SCRIPT)
                .key(&key)
                .arg(&self.config.instance_id)
                .invoke::<i32>(&mut conn)
        });

        match result {
            Ok(1) => info!(race_id = %key, instance_id = %self.config.instance_id, "Released race token"),
            Ok(_) => debug!(race_id = %key, "Race token was not held"),
            Err(e) => warn!(race_id = %key, error = %e, "Failed to release race token"),
        }
    }
}

impl Drop for RedisRace {
    fn drop(&mut self) {
        for (_, renewal) in self.renewals.lock().drain() {
            renewal.abort();
        }
    }
}
