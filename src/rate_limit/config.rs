//! Per-resource limiter configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where window counts are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process sliding log; counts are per instance.
    #[default]
    Local,
    /// Redis sorted set; counts are shared by every instance.
    Shared,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// `{ identifier, limit, window }` for one protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace of the limiter, part of every storage key
    pub identifier: String,
    /// Admissions allowed per window
    pub limit: u32,
    /// Sliding window length (seconds)
    pub window_in_seconds: u64,
    /// Counting backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Keep admitted/rejected counters and log rejections
    #[serde(default)]
    pub analytics_enabled: bool,
}

impl LimiterConfig {
    /// Local limiter without analytics.
    pub fn new(identifier: impl Into<String>, limit: u32, window_in_seconds: u64) -> Self {
        Self {
            identifier: identifier.into(),
            limit,
            window_in_seconds,
            backend: BackendKind::Local,
            analytics_enabled: false,
        }
    }

    /// Select the counting backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable analytics.
    #[must_use]
    pub const fn with_analytics(mut self, enabled: bool) -> Self {
        self.analytics_enabled = enabled;
        self
    }

    /// Window as a [`Duration`].
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_in_seconds)
    }

    /// Reject an empty identifier or a zero limit or window.
    pub fn validate(&self) -> Result<(), String> {
        if self.identifier.trim().is_empty() {
            return Err("rate limiter identifier cannot be empty".to_string());
        }
        if self.limit == 0 {
            return Err(format!(
                "rate limiter '{}': limit must be greater than 0",
                self.identifier
            ));
        }
        if self.window_in_seconds == 0 {
            return Err(format!(
                "rate limiter '{}': window_in_seconds must be greater than 0",
                self.identifier
            ));
        }
        Ok(())
    }
}
