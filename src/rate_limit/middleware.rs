//! Wrapping request handlers with a [`RateLimiter`].

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::Response;

use super::limiter::RateLimiter;
use super::response::create_rate_limit_response;
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// Key used for requests without an authenticated user.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// User attached to a request by authentication middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User id, used as the rate limit key
    pub id: String,
    /// Email address, if known
    pub email: Option<String>,
}

/// Derives the limiter key from a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// The authenticated user id, or `"anonymous"`.
#[must_use]
pub fn user_id_or_anonymous(request: &Request) -> String {
    request
        .extensions()
        .get::<AuthenticatedUser>()
        .map_or_else(|| ANONYMOUS_KEY.to_string(), |user| user.id.clone())
}

/// Default [`KeyFn`].
#[must_use]
pub fn default_key_fn() -> KeyFn {
    Arc::new(user_id_or_anonymous)
}

/// Count the request and either answer 429 or run `handler`.
///
/// The handler's response is returned untouched when admitted.
pub async fn with_rate_limit<H, Fut, K>(
    request: Request,
    handler: H,
    limiter: &RateLimiter,
    key_fn: K,
) -> Response
where
    H: FnOnce(Request) -> Fut,
    Fut: Future<Output = Response>,
    K: Fn(&Request) -> String,
{
    let key = key_fn(&request);
    let result = limiter.limit(&key).await;

    if result.rate_limited {
        ldebug!(
            "gateway",
            LogStage::RateLimit,
            LogComponent::Limiter,
            "reject",
            "request rejected by rate limiter",
            limiter = %limiter.identifier(),
            key = %key,
            path = %request.uri().path()
        );
        return create_rate_limit_response(&result);
    }

    handler(request).await
}

#[derive(Clone)]
struct LayerState {
    limiter: Arc<RateLimiter>,
    key_fn: KeyFn,
}

async fn rate_limit_middleware(
    State(state): State<LayerState>,
    request: Request,
    next: Next,
) -> Response {
    with_rate_limit(
        request,
        |request| next.run(request),
        &state.limiter,
        |request: &Request| (state.key_fn)(request),
    )
    .await
}

/// Rate limit every route currently in `router`.
pub fn rate_limited<S>(router: Router<S>, limiter: Arc<RateLimiter>, key_fn: KeyFn) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(from_fn_with_state(
        LayerState { limiter, key_fn },
        rate_limit_middleware,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{LimiterConfig, LocalBackend};
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use tower::ServiceExt;

    fn limiter(limit: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            LimiterConfig::new("test", limit, 60),
            Arc::new(LocalBackend::new()),
        ))
    }

    fn request_as(user: Option<&str>) -> Request {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/echo")
            .body(Body::empty())
            .unwrap();
        if let Some(id) = user {
            request.extensions_mut().insert(AuthenticatedUser {
                id: id.to_string(),
                email: None,
            });
        }
        request
    }

    #[test]
    fn key_defaults_to_anonymous() {
        assert_eq!(user_id_or_anonymous(&request_as(None)), "anonymous");
        assert_eq!(user_id_or_anonymous(&request_as(Some("u-1"))), "u-1");
    }

    #[tokio::test]
    async fn handler_runs_only_when_admitted() {
        let limiter = limiter(1);
        let ok = || async { (StatusCode::CREATED, "done").into_response() };

        let first =
            with_rate_limit(request_as(Some("u")), |_| ok(), &limiter, user_id_or_anonymous).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second =
            with_rate_limit(request_as(Some("u")), |_| ok(), &limiter, user_id_or_anonymous).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn layer_limits_per_key() {
        let router: Router = rate_limited(
            Router::new().route("/api/echo", post(|| async { "ok" })),
            limiter(1),
            default_key_fn(),
        );

        let a = router.clone().oneshot(request_as(Some("a"))).await.unwrap();
        let b = router.clone().oneshot(request_as(Some("b"))).await.unwrap();
        let a_again = router.oneshot(request_as(Some("a"))).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(a_again.headers()["x-ratelimit-limit"], "1");
    }
}
