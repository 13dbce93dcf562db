//! Baton Actor Election
//!
//! Keeps exactly one of many cooperating processes acting at a time, using
//! nothing but a shared key-value store, its change notifications, and a race
//! primitive that hands a named token to one caller.
//!
//! # Features
//!
//! - **Election**: the actor race decides who acts; the winner runs the
//!   caller's action exactly once and starts heartbeating
//! - **Fast handoff**: an exiting actor announces a vacancy; candidates race
//!   on the notification
//! - **Crash recovery**: candidates poll the heartbeat; after three missed
//!   beats one of them takes over through the reset race
//! - **Backends**: in-memory (`MemoryHub`) and Redis (`RedisStore`,
//!   `RedisRace`, feature `redis`)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use baton_election::{ActorElection, ElectionConfig, MemoryHub};
//!
//! async fn example() -> baton_election::Result<()> {
//!     let hub = MemoryHub::new();
//!     let config = ElectionConfig::new("worker-1");
//!     let election = Arc::new(ActorElection::new(
//!         config,
//!         Arc::new(hub.store("worker-1")),
//!         Arc::new(hub.race("worker-1")),
//!     )?);
//!
//!     election.join(|| println!("I'm the actor!")).await?;
//!     election.wait_until_acting().await;
//!
//!     // On the way out: hand off to the next process
//!     election.shutdown().await;
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod election;
mod error;
mod heartbeat;
pub mod memory;
mod race;
mod store;

#[cfg(feature = "redis")]
pub mod redis;

pub use clock::{Clock, SystemClock, TokioClock};
pub use config::ElectionConfig;
pub use election::{Action, ActorElection, Role};
pub use error::{ElectionError, Result};
pub use heartbeat::{evaluate_heartbeat, HeartbeatStatus};
pub use memory::{MemoryHub, MemoryRace, MemoryStore};
pub use race::RacePrimitive;
pub use store::{ChangeEvent, SharedStore, Subscription};

#[cfg(feature = "redis")]
pub use crate::redis::{RedisBackendConfig, RedisRace, RedisStore};
