//! Wall-clock sources for heartbeat timestamps

use chrono::Utc;

/// Milliseconds since the Unix epoch, comparable across processes.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock driven by tokio's timer, for in-process simulations.
///
/// Under a paused runtime (`tokio::time::pause`) it only moves when tokio time
/// advances, which keeps heartbeat ages deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    epoch_ms: i64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Report `epoch_ms` at the moment of creation
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            epoch_ms,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as i64
    }
}
