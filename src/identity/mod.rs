//! # 身份提供方
//!
//! The hosted auth backend as seen by the rest of the crate: a session type,
//! a structured error, and the [`IdentityProvider`] trait the refresh
//! coordinator drives.

mod gotrue;

pub use gotrue::{GoTrueClient, SESSION_STORAGE_KEY};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Provider user id
    pub id: String,
    /// Email address, when the provider returns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Credential issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for API calls
    pub access_token: String,
    /// Token exchanged for a new session
    pub refresh_token: String,
    /// Token type, normally `bearer`
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expiry in seconds since the Unix epoch.
    pub expires_at: i64,
    /// Owner of the session
    pub user: SessionUser,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Whether the access token has expired at `now_secs`.
    #[must_use]
    pub const fn is_expired(&self, now_secs: i64) -> bool {
        self.expires_at <= now_secs
    }
}

/// Broad class of an identity provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityErrorKind {
    /// The provider throttled the request.
    RateLimited,
    /// Transport failure or timeout.
    Network,
    /// Credentials or refresh token were rejected.
    InvalidCredentials,
    /// No session is held, so there is nothing to refresh or sign out.
    SessionMissing,
    /// Any other provider-side failure.
    Upstream,
}

/// Failure reported by an [`IdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct IdentityError {
    /// Failure class
    pub kind: IdentityErrorKind,
    /// Provider message
    pub message: String,
    /// HTTP status, when the failure came from a response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl IdentityError {
    /// Build an error without an HTTP status.
    pub fn new(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Attach the HTTP status that produced this error.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Session operations of the identity backend.
///
/// `get_session` must not touch the network. It reports what the client
/// currently holds.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Currently held, unexpired session.
    async fn get_session(&self) -> Result<Option<Session>, IdentityError>;

    /// Exchange the held refresh token for a new session.
    async fn refresh_session(&self) -> Result<Session, IdentityError>;

    /// End the session locally and at the provider.
    async fn sign_out(&self) -> Result<(), IdentityError>;
}
