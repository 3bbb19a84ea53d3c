//! # 错误类型定义

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum PipError {
    /// 配置相关错误
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Persisted client state could not be read or written
    #[error("storage error: {message}")]
    Storage {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误
    #[error("network error: {message}")]
    Network {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 认证和授权错误
    #[error("auth error: {message}")]
    Auth {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 速率限制错误
    #[error("rate limited: {message}")]
    RateLimit {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Counting store (Redis) failure
    #[error("cache error: {message}")]
    Cache {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 序列化/反序列化错误
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: anyhow::Error,
    },

    /// IO相关错误
    #[error("io error: {message}")]
    Io {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// 服务器启动错误
    #[error("server start error: {message}")]
    ServerStart {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Error wrapped with additional context
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted
        context: String,
        /// Underlying cause
        #[source]
        source: Box<PipError>,
    },
}

impl PipError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Storage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            Self::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            Self::Auth { .. } => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
            Self::RateLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_ERROR"),
            Self::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::ServerStart { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "SERVER_START_ERROR"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a storage error
    pub fn storage<T: Into<String>>(message: T) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
            source: None,
        }
    }

    /// 创建速率限制错误
    pub fn rate_limit<T: Into<String>>(message: T) -> Self {
        Self::RateLimit {
            message: message.into(),
            source: None,
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建服务器启动错误
    pub fn server_start_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerStart {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for PipError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "file operation failed".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for PipError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML parse failed", err)
    }
}

impl From<serde_json::Error> for PipError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON serialization failed".to_string(),
            source: err.into(),
        }
    }
}

impl From<redis::RedisError> for PipError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis command failed", err)
    }
}

impl From<reqwest::Error> for PipError {
    fn from(err: reqwest::Error) -> Self {
        Self::network_with_source("HTTP request failed", err)
    }
}

impl From<crate::storage::StorageError> for PipError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::storage_with_source("state store failure", err)
    }
}

impl IntoResponse for PipError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_http_response_parts();
        let body = json!({
            "success": false,
            "error": {
                "code": code,
                "message": self.to_string(),
            },
            "timestamp": chrono::Utc::now(),
        });
        (status, Json(body)).into_response()
    }
}
