//! GoTrue-compatible hosted auth client.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::{IdentityError, IdentityErrorKind, IdentityProvider, Session, SessionUser};
use crate::clock::{Clock, system_clock};
use crate::config::IdentityConfig;
use crate::error::{PipError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::storage::KeyValueStore;
use crate::{ldebug, linfo, lwarn};

/// Key under which a persisted session is stored.
pub const SESSION_STORAGE_KEY: &str = "pip.auth.session";

/// Provider error code for throttled requests.
const RATE_LIMIT_ERROR_CODE: &str = "over_request_rate_limit";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: SessionUser,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorBody {
    fn message(&self, status: StatusCode) -> String {
        self.msg
            .clone()
            .or_else(|| self.error_description.clone())
            .or_else(|| self.message.clone())
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| format!("identity provider returned {status}"))
    }
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

/// Client for the hosted auth service.
///
/// Holds the current session in memory and, when persistence is enabled,
/// mirrors it into a [`KeyValueStore`] so it survives restarts.
pub struct GoTrueClient {
    base_url: String,
    anon_key: String,
    http: Client,
    session: RwLock<Option<Session>>,
    persistence: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for GoTrueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoTrueClient")
            .field("base_url", &self.base_url)
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl GoTrueClient {
    /// Build a client from configuration.
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipError::config_with_source("failed to build identity HTTP client", e))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            http,
            session: RwLock::new(None),
            persistence: None,
            clock: system_clock(),
        })
    }

    /// Persist the session in `store`, loading any session already there.
    #[must_use]
    pub fn with_persistence(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        match store.get(SESSION_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => self.replace_session(Some(session)),
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Storage,
                        LogComponent::IdentityClient,
                        "persisted_session_corrupt",
                        "ignoring unreadable persisted session",
                        error = %e
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Storage,
                    LogComponent::IdentityClient,
                    "persisted_session_unreadable",
                    "session storage unavailable",
                    error = %e
                );
            }
        }
        self.persistence = Some(store);
        self
    }

    /// Replace the clock used for expiry checks.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_secs(&self) -> i64 {
        self.clock.now_ms() / 1000
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn current(&self) -> Option<Session> {
        self.session.read().ok().and_then(|guard| guard.clone())
    }

    fn replace_session(&self, session: Option<Session>) {
        if let Ok(mut guard) = self.session.write() {
            guard.clone_from(&session);
        }
    }

    fn store_session(&self, session: Option<&Session>) {
        self.replace_session(session.cloned());

        let Some(store) = &self.persistence else {
            return;
        };
        let result = match session {
            Some(session) => serde_json::to_string(session)
                .map_err(|e| crate::storage::StorageError::Corrupt(e.to_string()))
                .and_then(|raw| store.set(SESSION_STORAGE_KEY, &raw)),
            None => store.remove(SESSION_STORAGE_KEY),
        };
        if let Err(e) = result {
            lwarn!(
                "system",
                LogStage::Storage,
                LogComponent::IdentityClient,
                "persist_session_failed",
                "failed to persist session",
                error = %e
            );
        }
    }

    fn session_from(&self, token: TokenResponse) -> Session {
        let expires_at = token
            .expires_at
            .unwrap_or_else(|| self.now_secs() + token.expires_in.unwrap_or(3600));
        Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: token.user,
        }
    }

    async fn error_from(response: Response) -> IdentityError {
        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let message = body.message(status);

        let kind = if status == StatusCode::TOO_MANY_REQUESTS
            || body.error_code.as_deref() == Some(RATE_LIMIT_ERROR_CODE)
        {
            IdentityErrorKind::RateLimited
        } else {
            match status {
                StatusCode::BAD_REQUEST
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::UNPROCESSABLE_ENTITY => IdentityErrorKind::InvalidCredentials,
                _ => IdentityErrorKind::Upstream,
            }
        };

        IdentityError::new(kind, message).with_status(status.as_u16())
    }

    fn transport_error(e: &reqwest::Error) -> IdentityError {
        IdentityError::new(IdentityErrorKind::Network, format!("identity request failed: {e}"))
    }

    async fn token_request<B: Serialize + Sync>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> std::result::Result<Session, IdentityError> {
        let response = self
            .http
            .post(self.endpoint("token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            IdentityError::new(
                IdentityErrorKind::Upstream,
                format!("malformed token response: {e}"),
            )
        })?;
        Ok(self.session_from(token))
    }

    /// Sign in with email and password and hold the resulting session.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> std::result::Result<Session, IdentityError> {
        let session = self
            .token_request("password", &PasswordGrant { email, password })
            .await?;
        self.store_session(Some(&session));

        linfo!(
            "system",
            LogStage::Authentication,
            LogComponent::IdentityClient,
            "sign_in",
            "signed in",
            user_id = %session.user.id
        );
        Ok(session)
    }

    /// Resolve the user owning `access_token`.
    pub async fn get_user(
        &self,
        access_token: &str,
    ) -> std::result::Result<SessionUser, IdentityError> {
        let response = self
            .http
            .get(self.endpoint("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response.json::<SessionUser>().await.map_err(|e| {
            IdentityError::new(
                IdentityErrorKind::Upstream,
                format!("malformed user response: {e}"),
            )
        })
    }
}

#[async_trait]
impl IdentityProvider for GoTrueClient {
    async fn get_session(&self) -> std::result::Result<Option<Session>, IdentityError> {
        let now = self.now_secs();
        Ok(self.current().filter(|session| !session.is_expired(now)))
    }

    async fn refresh_session(&self) -> std::result::Result<Session, IdentityError> {
        let Some(current) = self.current() else {
            return Err(IdentityError::new(
                IdentityErrorKind::SessionMissing,
                "no refresh token available",
            ));
        };

        match self
            .token_request(
                "refresh_token",
                &RefreshGrant {
                    refresh_token: &current.refresh_token,
                },
            )
            .await
        {
            Ok(session) => {
                self.store_session(Some(&session));
                ldebug!(
                    "system",
                    LogStage::SessionRefresh,
                    LogComponent::IdentityClient,
                    "token_refreshed",
                    "refresh token exchanged",
                    expires_at = session.expires_at
                );
                Ok(session)
            }
            Err(e) => {
                // A revoked refresh token can never succeed again.
                if e.kind == IdentityErrorKind::InvalidCredentials {
                    self.store_session(None);
                }
                Err(e)
            }
        }
    }

    async fn sign_out(&self) -> std::result::Result<(), IdentityError> {
        let Some(current) = self.current() else {
            return Ok(());
        };
        self.store_session(None);

        let response = self
            .http
            .post(self.endpoint("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&current.access_token)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        // An already invalid token still means we are signed out.
        if response.status().is_success() || response.status() == StatusCode::UNAUTHORIZED {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }
}
