//! Cross-process race primitive

use async_trait::async_trait;

use crate::error::Result;

/// Named mutual-exclusion tokens shared by every participating process.
///
/// At most one caller wins `race` for a given id until the winner calls
/// `end_race`. Implementations may also reclaim the token of a holder that
/// died; the election never depends on that for correctness.
#[async_trait]
pub trait RacePrimitive: Send + Sync {
    /// Try to take the token for `id`. Returns `true` to exactly one caller.
    async fn race(&self, id: &str) -> Result<bool>;

    /// Release the token for `id`.
    ///
    /// Synchronous so it can complete on the way out of a terminating
    /// process. Only has an effect when called by the current holder.
    fn end_race(&self, id: &str);
}
