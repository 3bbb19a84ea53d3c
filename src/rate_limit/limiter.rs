//! # 限流器
//!
//! Turns backend window counts into admission decisions for one resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::backend::{CountingBackend, WindowCount, window_ms};
use super::config::{BackendKind, LimiterConfig};
use super::local::{DEFAULT_SWEEP_INTERVAL, LocalBackend, SweeperHandle};
use super::shared::SharedBackend;
use crate::clock::{Clock, system_clock};
use crate::config::RedisConfig;
use crate::error::{PipError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// Decision for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the request was admitted
    pub success: bool,
    /// Configured limit
    pub limit: u32,
    /// Admissions left in the current window
    pub remaining: u32,
    /// Time (ms since epoch) when the oldest counted request leaves the window.
    pub reset: i64,
    /// Inverse of `success`
    pub rate_limited: bool,
    /// Whole seconds until a retry can succeed, at least 1. Only set when limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    fn from_count(limit: u32, window_ms: i64, count: &WindowCount) -> Self {
        let reset = count
            .oldest_ms
            .unwrap_or(count.now_ms)
            .saturating_add(window_ms);
        let remaining = limit.saturating_sub(count.count);

        if count.admitted {
            Self {
                success: true,
                limit,
                remaining,
                reset,
                rate_limited: false,
                retry_after_seconds: None,
            }
        } else {
            let wait_ms = u64::try_from(reset.saturating_sub(count.now_ms)).unwrap_or(0);
            Self {
                success: false,
                limit,
                remaining,
                reset,
                rate_limited: true,
                retry_after_seconds: Some(wait_ms.div_ceil(1000).max(1)),
            }
        }
    }

    /// Admission used when the backend cannot be reached.
    fn fail_open(limit: u32, reset: i64) -> Self {
        Self {
            success: true,
            limit,
            remaining: limit,
            reset,
            rate_limited: false,
            retry_after_seconds: None,
        }
    }
}

/// Admitted/rejected counters kept when analytics are enabled.
#[derive(Debug, Default)]
pub struct LimiterStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    backend_errors: AtomicU64,
}

/// Copy of [`LimiterStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStatsSnapshot {
    /// Requests admitted
    pub admitted: u64,
    /// Requests rejected
    pub rejected: u64,
    /// Backend failures that were admitted anyway
    pub backend_errors: u64,
}

impl LimiterStats {
    /// Read the counters.
    #[must_use]
    pub fn snapshot(&self) -> LimiterStatsSnapshot {
        LimiterStatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Sliding-window limiter for one resource.
///
/// Keys are namespaced as `ratelimit:{identifier}:{key}` so limiters with
/// different identifiers never share counts.
pub struct RateLimiter {
    config: LimiterConfig,
    backend: Arc<dyn CountingBackend>,
    clock: Arc<dyn Clock>,
    stats: LimiterStats,
    sweeper: Option<SweeperHandle>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("sweeper", &self.sweeper.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Limiter over `backend` on the system clock, without a sweeper.
    pub fn new(config: LimiterConfig, backend: Arc<dyn CountingBackend>) -> Self {
        Self {
            config,
            backend,
            clock: system_clock(),
            stats: LimiterStats::default(),
            sweeper: None,
        }
    }

    /// Use `clock` for `reset` and retry-after arithmetic.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tie a sweeper's lifetime to this limiter.
    #[must_use]
    pub fn with_sweeper(mut self, sweeper: SweeperHandle) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Limiter namespace.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    /// Limiter configuration.
    #[must_use]
    pub const fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Name of the counting backend.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Admission counters, all zero unless analytics are enabled.
    #[must_use]
    pub fn stats(&self) -> LimiterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Storage key for a caller key.
    #[must_use]
    pub fn storage_key(&self, key: &str) -> String {
        format!("ratelimit:{}:{}", self.config.identifier, key)
    }

    /// Count one request for `key` and decide whether to admit it.
    ///
    /// Backend failures admit the request.
    pub async fn limit(&self, key: &str) -> RateLimitResult {
        let window_ms = window_ms(self.config.window());
        let storage_key = self.storage_key(key);

        let result = match self
            .backend
            .hit(&storage_key, self.config.limit, self.config.window())
            .await
        {
            Ok(count) => RateLimitResult::from_count(self.config.limit, window_ms, &count),
            Err(e) => {
                self.stats.backend_errors.fetch_add(1, Ordering::Relaxed);
                lwarn!(
                    "system",
                    LogStage::RateLimit,
                    LogComponent::Limiter,
                    "backend_error",
                    "rate limit backend failed, admitting request",
                    limiter = %self.config.identifier,
                    backend = self.backend.name(),
                    error = %e
                );
                RateLimitResult::fail_open(
                    self.config.limit,
                    self.clock.now_ms().saturating_add(window_ms),
                )
            }
        };

        if self.config.analytics_enabled {
            self.record(key, &result);
        }
        result
    }

    fn record(&self, key: &str, result: &RateLimitResult) {
        if result.rate_limited {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            linfo!(
                "system",
                LogStage::RateLimit,
                LogComponent::Limiter,
                "request_rejected",
                "rate limit exceeded",
                limiter = %self.config.identifier,
                key = %key,
                limit = result.limit,
                retry_after_seconds = result.retry_after_seconds.unwrap_or(0)
            );
        } else {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Build a limiter, choosing its backend once from `config.backend`.
///
/// Local limiters get a sweeper owned by the limiter. Must be called inside
/// a Tokio runtime.
pub async fn create_limiter(
    config: LimiterConfig,
    redis: Option<&RedisConfig>,
) -> Result<RateLimiter> {
    config.validate().map_err(PipError::config)?;
    let backend: Arc<dyn CountingBackend> = match config.backend {
        BackendKind::Local => return Ok(local_limiter(config)),
        BackendKind::Shared => {
            let redis = redis.ok_or_else(|| {
                crate::error!(
                    Config,
                    "rate limiter '{}' uses the shared backend but redis is not configured",
                    config.identifier
                )
            })?;
            Arc::new(SharedBackend::connect(redis).await?)
        }
    };
    Ok(RateLimiter::new(config, backend))
}

/// Build every configured limiter, keyed by identifier.
///
/// Shared limiters reuse one redis connection.
pub async fn create_limiters(
    configs: &[LimiterConfig],
    redis: Option<&RedisConfig>,
) -> Result<HashMap<String, Arc<RateLimiter>>> {
    let mut limiters = HashMap::with_capacity(configs.len());
    let mut shared: Option<SharedBackend> = None;

    for config in configs {
        config.validate().map_err(PipError::config)?;
        let limiter = match config.backend {
            BackendKind::Local => local_limiter(config.clone()),
            BackendKind::Shared => {
                let backend = match &shared {
                    Some(existing) => existing.clone(),
                    None => {
                        let redis = redis.ok_or_else(|| {
                            crate::error!(
                                Config,
                                "rate limiter '{}' uses the shared backend but redis is not configured",
                                config.identifier
                            )
                        })?;
                        let backend = SharedBackend::connect(redis).await?;
                        shared = Some(backend.clone());
                        backend
                    }
                };
                RateLimiter::new(config.clone(), Arc::new(backend))
            }
        };

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Limiter,
            "limiter_created",
            "rate limiter ready",
            limiter = %config.identifier,
            backend = %config.backend,
            limit = config.limit,
            window_secs = config.window_in_seconds
        );
        limiters.insert(config.identifier.clone(), Arc::new(limiter));
    }

    Ok(limiters)
}

fn local_limiter(config: LimiterConfig) -> RateLimiter {
    let backend = LocalBackend::new();
    let sweeper = backend.start_sweeper(DEFAULT_SWEEP_INTERVAL);
    RateLimiter::new(config, Arc::new(backend)).with_sweeper(sweeper)
}
