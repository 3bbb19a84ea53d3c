//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pip_tracker::clock::ManualClock;
use pip_tracker::identity::{IdentityError, IdentityErrorKind, IdentityProvider, Session, SessionUser};
use pip_tracker::session::{FixedJitter, SessionRefreshCoordinator};
use pip_tracker::storage::KeyValueStore;

pub const T0: i64 = 1_700_000_000_000;
pub const MINUTE_MS: i64 = 60_000;

pub fn session(token: &str) -> Session {
    Session {
        access_token: format!("access-{token}"),
        refresh_token: format!("refresh-{token}"),
        token_type: "bearer".to_string(),
        expires_at: T0 / 1000 + 3600,
        user: SessionUser {
            id: "user-1".to_string(),
            email: Some("pip@example.com".to_string()),
        },
    }
}

pub fn throttled() -> IdentityError {
    IdentityError::new(IdentityErrorKind::RateLimited, "Request rate limit reached").with_status(429)
}

/// Identity provider answering refreshes from a script, after an optional delay.
pub struct ScriptedProvider {
    held: Mutex<Option<Session>>,
    script: Mutex<VecDeque<Result<Session, IdentityError>>>,
    delay: Duration,
    lookup_delay: Duration,
    refresh_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::with_lookup_delay(delay, Duration::ZERO)
    }

    /// Like [`Self::new`], but `get_session` also waits `lookup_delay`.
    pub fn with_lookup_delay(delay: Duration, lookup_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            delay,
            lookup_delay,
            refresh_calls: AtomicUsize::new(0),
        })
    }

    /// Queue the result of the next refresh. Unscripted refreshes succeed.
    pub fn then(&self, result: Result<Session, IdentityError>) -> &Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn hold(&self, session: Option<Session>) {
        *self.held.lock().unwrap() = session;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn get_session(&self) -> Result<Option<Session>, IdentityError> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        Ok(self.held.lock().unwrap().clone())
    }

    async fn refresh_session(&self) -> Result<Session, IdentityError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or_else(|| Ok(session(&call.to_string())));
        if let Ok(session) = &result {
            self.hold(Some(session.clone()));
        }
        result
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.hold(None);
        Ok(())
    }
}

/// Coordinator on a manual clock with jitter pinned to `jitter_ms`.
pub fn coordinator(
    provider: Arc<ScriptedProvider>,
    store: Arc<dyn KeyValueStore>,
    clock: &ManualClock,
    jitter_ms: u64,
) -> SessionRefreshCoordinator {
    SessionRefreshCoordinator::builder(provider)
        .store(store)
        .clock(Arc::new(clock.clone()))
        .jitter(Arc::new(FixedJitter(Duration::from_millis(jitter_ms))))
        .build()
}
