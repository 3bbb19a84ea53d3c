//! Forwarding admitted requests to their upstream service.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};

use crate::config::UpstreamConfig;
use crate::error::{PipError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::rate_limit::AuthenticatedUser;
use crate::{ldebug, lwarn};

/// Largest request body accepted for forwarding.
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Header carrying the authenticated user id upstream.
pub const USER_ID_HEADER: &str = "x-pip-user-id";

/// Upstream URL and the extra headers sent with every request.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    /// Route path served by the gateway
    pub route: String,
    /// Target URL
    pub url: String,
    /// Identifier of the guarding limiter
    pub limiter: String,
    /// Extra headers sent upstream
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl UpstreamTarget {
    /// Parse header names and values from config.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    PipError::config_with_source(format!("invalid header name '{name}'"), e)
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    PipError::config_with_source(format!("invalid value for header '{name}'"), e)
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            route: config.route.clone(),
            url: config.url.clone(),
            limiter: config.limiter.clone(),
            headers,
        })
    }
}

#[derive(Clone)]
pub(crate) struct ForwardState {
    pub http: reqwest::Client,
    pub target: Arc<UpstreamTarget>,
}

/// POST the request body to the upstream and relay its answer.
pub(crate) async fn forward(State(state): State<ForwardState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return PipError::Serialization {
                message: "failed to read request body".to_string(),
                source: anyhow::Error::new(e),
            }
            .into_response();
        }
    };

    let mut upstream = state.http.post(&state.target.url).body(bytes);
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        upstream = upstream.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
        upstream = upstream.header(USER_ID_HEADER, user.id.as_str());
    }
    for (name, value) in &state.target.headers {
        upstream = upstream.header(name, value);
    }

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            lwarn!(
                "gateway",
                LogStage::Forwarding,
                LogComponent::Gateway,
                "upstream_error",
                "upstream request failed",
                route = %state.target.route,
                error = %e
            );
            return PipError::network_with_source("upstream request failed", e).into_response();
        }
    };

    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return PipError::network_with_source("failed to read upstream response", e)
                .into_response();
        }
    };

    ldebug!(
        "gateway",
        LogStage::Forwarding,
        LogComponent::Gateway,
        "forwarded",
        "request forwarded",
        route = %state.target.route,
        status = status.as_u16(),
        bytes = body.len()
    );

    let mut relayed = Response::new(Body::from(body));
    *relayed.status_mut() = status;
    if let Some(content_type) = content_type {
        relayed.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    relayed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(headers: Vec<(&str, &str)>) -> UpstreamConfig {
        UpstreamConfig {
            route: "/api/x".to_string(),
            url: "http://upstream/x".to_string(),
            limiter: "x".to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_configured_headers() {
        let target = UpstreamTarget::from_config(&upstream(vec![("X-Api-Key", "secret")])).unwrap();
        assert_eq!(target.headers[0].0.as_str(), "x-api-key");
        assert_eq!(target.headers[0].1, "secret");
    }

    #[test]
    fn rejects_invalid_header_name() {
        let err = UpstreamTarget::from_config(&upstream(vec![("bad header", "v")])).unwrap_err();
        assert!(err.to_string().contains("invalid header name"));
    }
}
