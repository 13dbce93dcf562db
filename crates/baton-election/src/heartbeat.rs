//! Heartbeat staleness policy

use std::time::Duration;

/// What a candidate concludes from the stored heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// No actor has ever written a heartbeat
    Absent,
    /// Written within the timeout
    Fresh { age_ms: i64 },
    /// Older than the timeout: the actor is presumed crashed
    Stale { age_ms: i64 },
    /// Not a timestamp; no live actor would have written it
    Malformed,
}

impl HeartbeatStatus {
    pub fn needs_recovery(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Malformed)
    }
}

/// Classify a raw heartbeat value read at `now_ms`.
///
/// An absent heartbeat is never a timeout: processes cold-starting together
/// settle through the actor race, not the reset race. Timestamps from the
/// future (clock skew) count as fresh.
pub fn evaluate_heartbeat(raw: Option<&str>, now_ms: i64, timeout: Duration) -> HeartbeatStatus {
    let Some(raw) = raw else {
        return HeartbeatStatus::Absent;
    };
    let Ok(written_ms) = raw.trim().parse::<i64>() else {
        return HeartbeatStatus::Malformed;
    };

    let age_ms = now_ms.saturating_sub(written_ms);
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    if age_ms > timeout_ms {
        HeartbeatStatus::Stale { age_ms }
    } else {
        HeartbeatStatus::Fresh { age_ms }
    }
}
