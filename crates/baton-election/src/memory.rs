//! In-process collaborators.
//!
//! A `MemoryHub` is one coordination domain; every simulated process takes its
//! own store and race handles from it under a distinct origin name. Useful
//! for tests and for running several electors inside a single binary.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::Result;
use crate::race::RacePrimitive;
use crate::store::{ChangeEvent, SharedStore, Subscription};

const CHANGE_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Published {
    origin: String,
    event: ChangeEvent,
}

struct HubState {
    entries: RwLock<HashMap<String, String>>,
    tokens: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<Published>,
}

/// Shared state behind every handle of one coordination domain
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<HubState>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            state: Arc::new(HubState {
                entries: RwLock::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Store handle for the process named `origin`
    pub fn store(&self, origin: impl Into<String>) -> MemoryStore {
        MemoryStore {
            state: Arc::clone(&self.state),
            origin: origin.into(),
        }
    }

    /// Race handle for the process named `origin`
    pub fn race(&self, origin: impl Into<String>) -> MemoryRace {
        MemoryRace {
            state: Arc::clone(&self.state),
            origin: origin.into(),
        }
    }

    /// Current holder of a race token
    pub fn holder(&self, id: &str) -> Option<String> {
        self.state.tokens.lock().get(id).cloned()
    }

    /// Release every token held by `origin`, as a race primitive would once it
    /// notices the holder died. Returns how many tokens were freed.
    pub fn reclaim(&self, origin: &str) -> usize {
        let mut tokens = self.state.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, holder| holder != origin);
        before - tokens.len()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryStore {
    state: Arc<HubState>,
    origin: String,
}

impl MemoryStore {
    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.state.changes.send(Published {
            origin: self.origin.clone(),
            event,
        });
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let previous = self
            .state
            .entries
            .write()
            .insert(key.to_string(), value.to_string());

        if previous.as_deref() != Some(value) {
            self.publish(ChangeEvent::set(key, value));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let previous = self.state.entries.write().remove(key);

        if previous.is_some() {
            self.publish(ChangeEvent::removed(key));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut changes = self.state.changes.subscribe();
        let origin = self.origin.clone();
        let (tx, events) = mpsc::unbounded_channel();

        let feed = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(published) => {
                        if published.origin == origin {
                            continue;
                        }
                        if tx.send(published.event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(origin = %origin, skipped, "Change feed lagged; notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(events, feed))
    }
}

pub struct MemoryRace {
    state: Arc<HubState>,
    origin: String,
}

#[async_trait]
impl RacePrimitive for MemoryRace {
    async fn race(&self, id: &str) -> Result<bool> {
        tokio::task::yield_now().await;

        let mut tokens = self.state.tokens.lock();
        match tokens.entry(id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(self.origin.clone());
                Ok(true)
            }
        }
    }

    fn end_race(&self, id: &str) {
        let mut tokens = self.state.tokens.lock();
        if tokens.get(id) == Some(&self.origin) {
            tokens.remove(id);
        }
    }
}
