//! Counting backends behind a [`RateLimiter`](super::RateLimiter).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Window state right after one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Whether this hit was recorded.
    pub admitted: bool,
    /// Hits inside the window, including this one when admitted.
    pub count: u32,
    /// Timestamp (ms) of the oldest hit still inside the window.
    pub oldest_ms: Option<i64>,
    /// Backend time (ms) used for the decision.
    pub now_ms: i64,
}

/// Sliding-window counter.
///
/// `hit` must prune, count and conditionally record as one atomic step per key.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    /// Record a hit on `key` if fewer than `limit` hits fall inside `window`.
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowCount>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

pub(crate) fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
