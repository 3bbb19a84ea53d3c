//! # 会话刷新
//!
//! Client-side session refresh with persisted exponential-style backoff,
//! throttle detection and single-flight deduplication.

mod classify;
mod coordinator;
mod policy;

pub use classify::{FailureClass, ThrottleClassifier};
pub use coordinator::{CoordinatorBuilder, RefreshError, RefreshOutcome, SessionRefreshCoordinator};
pub use policy::{FixedJitter, Jitter, RandomJitter, RefreshPolicy};
