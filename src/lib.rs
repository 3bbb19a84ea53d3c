//! # PIP Tracker Library
//!
//! Session refresh coordination for clients of the hosted identity
//! provider, and per-user rate limiting for the costly LLM-backed endpoints.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{PipError, Result};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use session::{RefreshOutcome, SessionRefreshCoordinator};
