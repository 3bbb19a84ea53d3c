//! # 日志配置模块
//!
//! Logging setup and the structured log macros used across the crate.
//!
//! Every event carries `request_id`, `stage`, `component` and `operation`
//! fields so that refresh attempts and limiter decisions can be filtered
//! the same way in both binaries.

use std::env;
use std::fmt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Lifecycle stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    /// Process start-up
    Startup,
    /// Graceful shutdown
    Shutdown,
    /// Loading and validating configuration
    Configuration,
    /// Sign-in, sign-out and bearer token checks
    Authentication,
    /// Session refresh coordination
    SessionRefresh,
    /// Rate limit decisions
    RateLimit,
    /// Persisted state reads and writes
    Storage,
    /// Forwarding to upstream services
    Forwarding,
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::SessionRefresh => "session_refresh",
            Self::RateLimit => "rate_limit",
            Self::Storage => "storage",
            Self::Forwarding => "forwarding",
        };
        f.write_str(name)
    }
}

/// Component that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    /// Binary entry point
    Main,
    /// Configuration loader
    Config,
    /// Session refresh coordinator
    Coordinator,
    /// Identity provider client
    IdentityClient,
    /// Persisted key-value state
    StateStore,
    /// Rate limiter front end
    Limiter,
    /// In-process counting backend
    LocalBackend,
    /// Redis counting backend
    SharedBackend,
    /// HTTP gateway
    Gateway,
    /// Session CLI
    Cli,
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::Coordinator => "coordinator",
            Self::IdentityClient => "identity_client",
            Self::StateStore => "state_store",
            Self::Limiter => "limiter",
            Self::LocalBackend => "local_backend",
            Self::SharedBackend => "shared_backend",
            Self::Gateway => "gateway",
            Self::Cli => "cli",
        };
        f.write_str(name)
    }
}

/// Emit a structured `info` event.
///
/// `linfo!(request_id, stage, component, operation, description, extra = fields...)`
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr $(, $($fields:tt)*)?) => {
        ::tracing::info!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            message = %$description
            $(, $($fields)*)?
        )
    };
}

/// Emit a structured `debug` event.
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr $(, $($fields:tt)*)?) => {
        ::tracing::debug!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            message = %$description
            $(, $($fields)*)?
        )
    };
}

/// Emit a structured `warn` event.
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr $(, $($fields:tt)*)?) => {
        ::tracing::warn!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            message = %$description
            $(, $($fields)*)?
        )
    };
}

/// Emit a structured `error` event.
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $description:expr $(, $($fields:tt)*)?) => {
        ::tracing::error!(
            request_id = %$request_id,
            stage = %$stage,
            component = %$component,
            operation = $operation,
            message = %$description
            $(, $($fields)*)?
        )
    };
}

/// Default filter directives for a given base level.
#[must_use]
pub fn default_filter(level: &str) -> String {
    format!("{level},pip_tracker=debug,hyper=warn,reqwest=warn,redis=warn")
}

/// 初始化日志系统
///
/// `RUST_LOG` wins over `log_level`. Calling this more than once is harmless,
/// later calls are ignored.
pub fn init_logging(log_level: Option<&str>) {
    let level = log_level.unwrap_or("info");
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(level));

    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::new(default_filter(level))))
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();

    if result.is_ok() {
        tracing::debug!(filter = %log_filter, "logging initialized");
    }
}
