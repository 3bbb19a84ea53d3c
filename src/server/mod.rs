//! # 网关服务器
//!
//! Axum gateway in front of the LLM-backed endpoints. Each configured
//! upstream route is guarded by its rate limiter, keyed by the user resolved
//! from the bearer token.

pub mod auth;
pub mod forward;

pub use auth::{TokenVerifier, authenticate, bearer_token};
pub use forward::{MAX_BODY_BYTES, USER_ID_HEADER, UpstreamTarget};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::{PipError, Result};
use crate::identity::GoTrueClient;
use crate::logging::{LogComponent, LogStage};
use crate::rate_limit::{RateLimiter, create_limiters, default_key_fn, rate_limited};
use crate::{linfo, lwarn};
use forward::{ForwardState, forward};

/// Everything the gateway routes need.
#[derive(Clone)]
pub struct GatewayState {
    /// Limiters by identifier
    pub limiters: HashMap<String, Arc<RateLimiter>>,
    /// Token verifier; `None` treats every request as anonymous
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    /// Client used for upstream requests
    pub http: reqwest::Client,
    /// Rate-limited upstream routes
    pub upstreams: Vec<UpstreamTarget>,
}

impl GatewayState {
    /// Build limiters, identity client and HTTP client from config.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        crate::ensure_config!(
            config.server.upstream_timeout_secs > 0,
            "server.upstream_timeout_secs must be greater than 0"
        );
        let limiters = create_limiters(&config.rate_limits, config.redis.as_ref()).await?;

        let verifier: Option<Arc<dyn TokenVerifier>> = if config.identity.anon_key.is_empty() {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Gateway,
                "identity_disabled",
                "identity.anon_key is empty, all requests are treated as anonymous"
            );
            None
        } else {
            Some(Arc::new(GoTrueClient::new(&config.identity)?))
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.server.upstream_timeout_secs))
            .build()
            .map_err(|e| PipError::internal_with_source("failed to build HTTP client", e))?;

        let upstreams = config
            .upstreams
            .iter()
            .map(UpstreamTarget::from_config)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            limiters,
            verifier,
            http,
            upstreams,
        })
    }
}

/// Assemble the gateway router.
pub fn build_router(state: &GatewayState) -> Result<Router> {
    let health_routes = Router::new()
        .route("/health", get(health))
        .with_state(state.limiters.clone());
    let mut app = Router::new().merge(health_routes);

    let mut routes = HashSet::new();
    for target in &state.upstreams {
        if !routes.insert(target.route.as_str()) {
            return Err(PipError::config(format!(
                "duplicate upstream route '{}'",
                target.route
            )));
        }
        let limiter = state.limiters.get(&target.limiter).cloned().ok_or_else(|| {
            PipError::config(format!(
                "upstream route '{}' references unknown limiter '{}'",
                target.route, target.limiter
            ))
        })?;

        let route = Router::new()
            .route(&target.route, post(forward))
            .with_state(ForwardState {
                http: state.http.clone(),
                target: Arc::new(target.clone()),
            });
        app = app.merge(rate_limited(route, limiter, default_key_fn()));

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Gateway,
            "route_registered",
            "rate limited route registered",
            route = %target.route,
            limiter = %target.limiter
        );
    }

    Ok(app
        .layer(from_fn_with_state(state.verifier.clone(), authenticate))
        .layer(TraceLayer::new_for_http()))
}

async fn health(State(limiters): State<HashMap<String, Arc<RateLimiter>>>) -> Json<Value> {
    let limiters: BTreeMap<_, _> = limiters
        .iter()
        .map(|(identifier, limiter)| {
            (
                identifier.clone(),
                json!({
                    "backend": limiter.backend_name(),
                    "limit": limiter.config().limit,
                    "windowInSeconds": limiter.config().window_in_seconds,
                    "stats": limiter.stats(),
                }),
            )
        })
        .collect();
    Json(json!({ "status": "ok", "limiters": limiters }))
}

/// Bind, serve until ctrl-c, then drop limiters (stopping their sweepers).
pub async fn run_server(config: AppConfig) -> Result<()> {
    let state = GatewayState::from_config(&config).await?;
    let router = build_router(&state)?;
    let addr = config.server.listen_addr();

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PipError::server_start_with_source(format!("failed to bind {addr}"), e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Gateway,
        "server_start",
        "gateway listening",
        addr = %addr,
        routes = state.upstreams.len()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PipError::server_start_with_source("gateway server error", e))?;

    drop(state);
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Gateway,
        "server_stopped",
        "gateway stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        lwarn!(
            "system",
            LogStage::Shutdown,
            LogComponent::Gateway,
            "signal_error",
            "failed to listen for ctrl-c",
            error = %e
        );
        std::future::pending::<()>().await;
    }
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Gateway,
        "shutdown_signal",
        "shutdown signal received"
    );
}
