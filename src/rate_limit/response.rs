//! HTTP 429 rendering of a [`RateLimitResult`].

use axum::Json;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::limiter::RateLimitResult;

/// Configured limit header
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Remaining admissions header
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Window reset header (ms since epoch)
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Rate limit headers for a decision. `Retry-After` only when limited.
#[must_use]
pub fn rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(result.limit));
    headers.insert(
        HeaderName::from_static(HEADER_REMAINING),
        HeaderValue::from(result.remaining),
    );
    headers.insert(HeaderName::from_static(HEADER_RESET), HeaderValue::from(result.reset));
    if let Some(retry_after) = result.retry_after_seconds {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
    headers
}

/// `429 Too Many Requests` with rate limit headers and a JSON body.
#[must_use]
pub fn create_rate_limit_response(result: &RateLimitResult) -> Response {
    let body = json!({
        "error": "Too many requests",
        "limit": result.limit,
        "remaining": result.remaining,
        "reset": result.reset,
        "retryAfterSeconds": result.retry_after_seconds.unwrap_or(1),
    });

    (
        StatusCode::TOO_MANY_REQUESTS,
        rate_limit_headers(result),
        Json(body),
    )
        .into_response()
}
