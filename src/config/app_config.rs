//! # 应用配置结构定义

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::rate_limit::{BackendKind, LimiterConfig};

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP gateway listener
    pub server: ServerConfig,
    /// Hosted auth backend
    pub identity: IdentityConfig,
    /// Session refresh throttling
    pub session_refresh: SessionRefreshConfig,
    /// Client-side state persistence
    pub storage: StorageConfig,
    /// Redis, required by `shared` limiters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    /// One entry per protected resource
    pub rate_limits: Vec<LimiterConfig>,
    /// Rate-limited routes forwarded to LLM services
    pub upstreams: Vec<UpstreamConfig>,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// Upstream request timeout (seconds)
    pub upstream_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            upstream_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    /// `host:port` listen address.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identity provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL of the auth service, e.g. `https://project.supabase.co`
    pub url: String,
    /// Public (anon) API key sent as the `apikey` header
    pub anon_key: String,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:54321".to_string(),
            anon_key: String::new(),
            request_timeout_secs: 10,
        }
    }
}

/// Session refresh throttling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRefreshConfig {
    /// Minimum spacing between refresh attempts (seconds)
    pub base_interval_secs: u64,
    /// Extra spacing per consecutive throttling failure (seconds)
    pub error_increment_secs: u64,
    /// Upper bound of the random jitter (seconds)
    pub max_jitter_secs: u64,
    /// Cap on the whole backoff window (seconds)
    pub max_backoff_secs: u64,
    /// Bound on a single refresh call (seconds)
    pub refresh_timeout_secs: u64,
    /// Case-insensitive message fragments that mark a throttling failure
    pub throttle_patterns: Vec<String>,
}

impl Default for SessionRefreshConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 600,
            error_increment_secs: 60,
            max_jitter_secs: 30,
            max_backoff_secs: 1800,
            refresh_timeout_secs: 30,
            throttle_patterns: vec![
                "rate limit".to_string(),
                "too many requests".to_string(),
                "over_request_rate_limit".to_string(),
                "429".to_string(),
            ],
        }
    }
}

/// Client state persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state file; `None` lets the CLI pick its default location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// Bound on a single limiter round trip (milliseconds)
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            command_timeout_ms: 2000,
        }
    }
}

/// A rate-limited route forwarded to an upstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Route path served by the gateway, e.g. `/api/transcribe`
    pub route: String,
    /// Target URL receiving the forwarded request
    pub url: String,
    /// `identifier` of the limiter guarding this route
    pub limiter: String,
    /// Extra headers sent upstream (e.g. provider API keys)
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be greater than 0".to_string());
        }
        if self.identity.url.trim().is_empty() {
            return Err("identity.url cannot be empty".to_string());
        }

        let refresh = &self.session_refresh;
        if refresh.base_interval_secs == 0 {
            return Err("session_refresh.base_interval_secs must be greater than 0".to_string());
        }
        if refresh.max_backoff_secs < refresh.base_interval_secs {
            return Err(
                "session_refresh.max_backoff_secs cannot be below base_interval_secs".to_string(),
            );
        }
        if refresh.refresh_timeout_secs == 0 {
            return Err("session_refresh.refresh_timeout_secs must be greater than 0".to_string());
        }

        let mut identifiers = HashSet::new();
        for limiter in &self.rate_limits {
            limiter.validate()?;
            if !identifiers.insert(limiter.identifier.as_str()) {
                return Err(format!("duplicate rate limiter '{}'", limiter.identifier));
            }
            if limiter.backend == BackendKind::Shared && self.redis.is_none() {
                return Err(format!(
                    "rate limiter '{}' uses the shared backend but no [redis] section is configured",
                    limiter.identifier
                ));
            }
        }

        let mut routes = HashSet::new();
        for upstream in &self.upstreams {
            if !upstream.route.starts_with('/') {
                return Err(format!("upstream route '{}' must start with '/'", upstream.route));
            }
            if !routes.insert(upstream.route.as_str()) {
                return Err(format!("duplicate upstream route '{}'", upstream.route));
            }
            if !identifiers.contains(upstream.limiter.as_str()) {
                return Err(format!(
                    "upstream route '{}' references unknown limiter '{}'",
                    upstream.route, upstream.limiter
                ));
            }
        }

        Ok(())
    }
}
