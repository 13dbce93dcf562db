//! Shared store capability and its change-notification feed

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A key changed in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    /// New value, or `None` when the key was removed
    pub value: Option<String>,
}

impl ChangeEvent {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// True when this event reports `key` being written (not removed)
    pub fn is_set_of(&self, key: &str) -> bool {
        self.key == key && self.value.is_some()
    }
}

/// Live feed of changes written by *other* store handles.
///
/// Dropping the subscription stops the feed task, so the handle's lifetime is
/// the listener's lifetime.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    feed: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `feed`; the task is aborted when the subscription goes away
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, feed: JoinHandle<()>) -> Self {
        Self {
            events,
            feed: Some(feed),
        }
    }

    /// Wrap a receiver whose sender is owned elsewhere
    pub fn from_receiver(events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { events, feed: None }
    }

    /// Next change, or `None` once the feed is closed
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Stop the feed. Events already buffered can still be drained.
    pub fn close(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Last-write-wins key-value store readable by every participating process.
///
/// Writes made through one handle are announced to subscriptions opened by
/// other handles; a handle never hears its own writes.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Open a change feed. Delivery is at-least-once and best effort.
    async fn subscribe(&self) -> Result<Subscription>;
}
