//! # 错误处理测试

use crate::error::{Context, PipError};
use axum::http::StatusCode;
use std::error::Error;

#[test]
fn test_config_error_creation() {
    let err = PipError::config("missing identity url");
    assert!(matches!(err, PipError::Config { .. }));
    assert_eq!(err.to_string(), "configuration error: missing identity url");
}

#[test]
fn test_config_error_with_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
    let err = PipError::config_with_source("failed to load config", io_err);

    assert!(matches!(err, PipError::Config { .. }));
    assert!(err.source().is_some());
}

#[test]
fn test_error_macro_formats_message() {
    let err = crate::error!(Cache, "redis unreachable at {}", "127.0.0.1:6379");
    assert!(matches!(err, PipError::Cache { .. }));
    assert!(err.to_string().contains("127.0.0.1:6379"));

    let io_err = std::io::Error::other("boom");
    let err = crate::error!(Storage, "write failed", source = io_err);
    assert!(err.source().is_some());
}

#[test]
fn test_context_wraps_and_keeps_status() {
    let result: Result<(), PipError> = Err(PipError::auth("token rejected"));
    let err = result.context("resolving bearer token").unwrap_err();

    assert!(matches!(err, PipError::Context { .. }));
    assert!(err.to_string().starts_with("resolving bearer token: "));
    assert_eq!(err.to_http_response_parts().0, StatusCode::UNAUTHORIZED);
}

#[test]
fn test_auto_conversion_from_io_error() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: PipError = io_err.into();
    assert!(matches!(err, PipError::Io { .. }));
}

#[test]
fn test_auto_conversion_from_toml_error() {
    let toml_err = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
    let err: PipError = toml_err.into();
    assert!(matches!(err, PipError::Config { .. }));
}

#[test]
fn test_rate_limit_maps_to_429() {
    let (status, code) = PipError::rate_limit("slow down").to_http_response_parts();
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(code, "RATE_LIMIT_ERROR");
}
