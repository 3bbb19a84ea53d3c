//! # 速率限制
//!
//! Per-user sliding-window limits for costly endpoints, with an in-process
//! backend for single instances and a Redis backend shared across instances.

mod backend;
mod config;
mod limiter;
mod local;
mod middleware;
mod response;
mod shared;

pub use backend::{CountingBackend, WindowCount};
pub use config::{BackendKind, LimiterConfig};
pub use limiter::{
    LimiterStats, LimiterStatsSnapshot, RateLimitResult, RateLimiter, create_limiter,
    create_limiters,
};
pub use local::{DEFAULT_SWEEP_INTERVAL, LocalBackend, SweeperHandle};
pub use middleware::{
    ANONYMOUS_KEY, AuthenticatedUser, KeyFn, default_key_fn, rate_limited, user_id_or_anonymous,
    with_rate_limit,
};
pub use response::{
    HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, create_rate_limit_response, rate_limit_headers,
};
pub use shared::SharedBackend;
