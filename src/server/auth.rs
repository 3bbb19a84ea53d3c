//! Bearer token resolution for gateway requests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::identity::{GoTrueClient, IdentityError, SessionUser};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::rate_limit::AuthenticatedUser;

/// Resolves an access token to its user.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve `access_token` to its user, or fail when the token is not valid.
    async fn verify(&self, access_token: &str) -> Result<SessionUser, IdentityError>;
}

#[async_trait]
impl TokenVerifier for GoTrueClient {
    async fn verify(&self, access_token: &str) -> Result<SessionUser, IdentityError> {
        self.get_user(access_token).await
    }
}

/// Token in `Authorization: Bearer <token>`, if present.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Attach [`AuthenticatedUser`] when the bearer token verifies.
///
/// Requests without a valid token continue anonymously.
pub async fn authenticate(
    State(verifier): State<Option<Arc<dyn TokenVerifier>>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let (Some(verifier), Some(token)) = (verifier, bearer_token(request.headers())) {
        match verifier.verify(&token).await {
            Ok(user) => {
                request.extensions_mut().insert(AuthenticatedUser {
                    id: user.id,
                    email: user.email,
                });
            }
            Err(e) => {
                ldebug!(
                    "gateway",
                    LogStage::Authentication,
                    LogComponent::Gateway,
                    "verify_token",
                    "bearer token rejected, continuing anonymously",
                    kind = ?e.kind,
                    error = %e
                );
            }
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case("Bearer abc", Some("abc"))]
    #[case("bearer   abc  ", Some("abc"))]
    #[case("Basic abc", None)]
    #[case("Bearer ", None)]
    #[case("Bearer", None)]
    fn parses_bearer_header(#[case] value: &str, #[case] expected: Option<&str>) {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), expected);
    }

    #[test]
    fn missing_header_is_none() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
