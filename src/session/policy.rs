//! Backoff arithmetic for session refreshes.

use std::time::Duration;

use crate::config::SessionRefreshConfig;

/// Timing parameters of the refresh throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Minimum spacing between attempts
    pub base_interval: Duration,
    /// Extra spacing per consecutive throttling failure
    pub error_increment: Duration,
    /// Upper bound of the random jitter
    pub max_jitter: Duration,
    /// Cap on the whole window
    pub max_backoff: Duration,
    /// Bound on a single provider call
    pub refresh_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from(&SessionRefreshConfig::default())
    }
}

impl From<&SessionRefreshConfig> for RefreshPolicy {
    fn from(config: &SessionRefreshConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(config.base_interval_secs),
            error_increment: Duration::from_secs(config.error_increment_secs),
            max_jitter: Duration::from_secs(config.max_jitter_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            refresh_timeout: Duration::from_secs(config.refresh_timeout_secs),
        }
    }
}

impl RefreshPolicy {
    /// `min(base + errors * increment + jitter, max_backoff)`
    #[must_use]
    pub fn backoff_window(&self, consecutive_errors: u32, jitter: Duration) -> Duration {
        let escalation = self.error_increment.saturating_mul(consecutive_errors);
        self.base_interval
            .saturating_add(escalation)
            .saturating_add(jitter)
            .min(self.max_backoff)
    }
}

/// Random spread added to each backoff check.
pub trait Jitter: Send + Sync {
    /// A duration in `[0, max]`.
    fn sample(&self, max: Duration) -> Duration;
}

/// Uniform jitter from `fastrand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(fastrand::u64(0..=max_ms))
    }
}

/// Constant jitter, clamped to the allowed maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter(pub Duration);

impl Jitter for FixedJitter {
    fn sample(&self, max: Duration) -> Duration {
        self.0.min(max)
    }
}
