//! # 会话刷新协调器
//!
//! Gates every session refresh behind a persisted backoff window and
//! collapses concurrent callers onto a single network call.
//!
//! The throttle state (last attempt, consecutive throttling failures and the
//! in-progress marker) lives in a [`KeyValueStore`] so that it survives
//! restarts. In-flight deduplication is process-local: one shared future per
//! coordinator, created under a short synchronous lock and awaited outside it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use thiserror::Error;

use super::classify::ThrottleClassifier;
use super::policy::{Jitter, RandomJitter, RefreshPolicy};
use crate::clock::{Clock, system_clock};
use crate::identity::{IdentityError, IdentityProvider, Session};
use crate::logging::{LogComponent, LogStage};
use crate::storage::{KeyValueStore, RefreshSnapshot, RefreshStateStore, StorageResult};
use crate::{ldebug, linfo, lwarn};

const LOG_ID: &str = "session";

/// Why a refresh produced no session.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefreshError {
    /// The backoff window has not elapsed; no call was made.
    #[error("session refresh skipped due to rate limiting, retry in {retry_after_ms} ms")]
    Skipped {
        /// Time left in the backoff window
        retry_after_ms: u64,
    },
    /// The provider throttled the refresh; backoff was escalated.
    #[error("identity provider throttled the refresh: {error}")]
    Throttled {
        /// Provider failure
        error: IdentityError,
    },
    /// Any other provider failure.
    #[error("session refresh failed: {error}")]
    Failed {
        /// Provider failure
        error: IdentityError,
    },
    /// The provider did not answer in time.
    #[error("session refresh timed out after {timeout_ms} ms")]
    TimedOut {
        /// Configured bound on the call
        timeout_ms: u64,
    },
}

/// `{ session, error }` result shared by every coordinator operation.
///
/// Both fields empty means "nothing to report", e.g. no storage is
/// configured or the user is signed out and refreshing is not allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    /// Session obtained, if any
    pub session: Option<Session>,
    /// Why no session was obtained, if anything went wrong
    pub error: Option<RefreshError>,
}

impl RefreshOutcome {
    /// Neither a session nor an error.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            session: None,
            error: None,
        }
    }

    /// A usable session.
    #[must_use]
    pub const fn with_session(session: Session) -> Self {
        Self {
            session: Some(session),
            error: None,
        }
    }

    /// A failure.
    #[must_use]
    pub const fn failed(error: RefreshError) -> Self {
        Self {
            session: None,
            error: Some(error),
        }
    }

    /// Milliseconds to wait when the refresh was skipped by backoff.
    #[must_use]
    pub const fn retry_after_ms(&self) -> Option<u64> {
        match &self.error {
            Some(RefreshError::Skipped { retry_after_ms }) => Some(*retry_after_ms),
            _ => None,
        }
    }
}

type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    state: Option<RefreshStateStore>,
    policy: RefreshPolicy,
    classifier: ThrottleClassifier,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    in_flight: Mutex<Option<InFlight>>,
}

/// Builder for [`SessionRefreshCoordinator`].
pub struct CoordinatorBuilder {
    provider: Arc<dyn IdentityProvider>,
    store: Option<Arc<dyn KeyValueStore>>,
    policy: RefreshPolicy,
    classifier: ThrottleClassifier,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl CoordinatorBuilder {
    /// Persist throttle state in `store`. Without a store every operation is a no-op.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Timing parameters.
    #[must_use]
    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Classifier deciding which failures escalate backoff.
    #[must_use]
    pub fn classifier(mut self, classifier: ThrottleClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Time source for the backoff window.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Jitter source for the backoff window.
    #[must_use]
    pub fn jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Finish the coordinator.
    pub fn build(self) -> SessionRefreshCoordinator {
        SessionRefreshCoordinator {
            inner: Arc::new(Inner {
                provider: self.provider,
                state: self.store.map(RefreshStateStore::new),
                policy: self.policy,
                classifier: self.classifier,
                clock: self.clock,
                jitter: self.jitter,
                in_flight: Mutex::new(None),
            }),
        }
    }
}

/// Rate-limited, deduplicated session refresher.
///
/// Cloning is cheap and clones share the same in-flight refresh.
#[derive(Clone)]
pub struct SessionRefreshCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRefreshCoordinator")
            .field("policy", &self.inner.policy)
            .field("has_store", &self.inner.state.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionRefreshCoordinator {
    /// Coordinator with system clock and random jitter.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Option<Arc<dyn KeyValueStore>>,
        policy: RefreshPolicy,
    ) -> Self {
        let builder = Self::builder(provider).policy(policy);
        match store {
            Some(store) => builder.store(store).build(),
            None => builder.build(),
        }
    }

    /// Builder with default policy, classifier, system clock and random jitter.
    pub fn builder(provider: Arc<dyn IdentityProvider>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            provider,
            store: None,
            policy: RefreshPolicy::default(),
            classifier: ThrottleClassifier::default(),
            clock: system_clock(),
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Timing parameters in use.
    #[must_use]
    pub fn policy(&self) -> &RefreshPolicy {
        &self.inner.policy
    }

    /// Whether the backoff window has elapsed.
    ///
    /// Always `false` without a store. Unreadable state counts as allowed.
    #[must_use]
    pub fn can_refresh(&self) -> bool {
        self.inner
            .state
            .as_ref()
            .is_some_and(|state| self.inner.remaining_backoff_ms(state).is_none())
    }

    /// Whether the persisted in-progress marker is set.
    #[must_use]
    pub fn is_refresh_in_progress(&self) -> bool {
        self.inner.state.as_ref().is_some_and(|state| {
            state.in_progress().unwrap_or_else(|e| {
                lwarn!(
                    LOG_ID,
                    LogStage::Storage,
                    LogComponent::Coordinator,
                    "read_in_progress",
                    "failed to read refresh marker",
                    error = %e
                );
                false
            })
        })
    }

    /// Current throttle state, with defaults for anything unreadable.
    #[must_use]
    pub fn refresh_state(&self) -> RefreshSnapshot {
        self.inner
            .state
            .as_ref()
            .map(RefreshStateStore::snapshot)
            .unwrap_or_default()
    }

    /// Refresh the session unless backoff forbids it.
    ///
    /// Joins the in-flight refresh when there is one, so concurrent callers
    /// observe the same result and cause at most one provider call.
    pub async fn refresh_session(&self) -> RefreshOutcome {
        let Some(state) = self.inner.state.clone() else {
            ldebug!(
                LOG_ID,
                LogStage::SessionRefresh,
                LogComponent::Coordinator,
                "refresh_without_store",
                "no state store configured, refresh is a no-op"
            );
            return RefreshOutcome::empty();
        };

        let refresh = {
            let mut slot = self.inner.lock_in_flight();
            if let Some(existing) = slot.as_ref() {
                ldebug!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "join_refresh",
                    "joining in-flight refresh"
                );
                existing.clone()
            } else {
                if let Some(retry_after_ms) = self.inner.remaining_backoff_ms(&state) {
                    linfo!(
                        LOG_ID,
                        LogStage::SessionRefresh,
                        LogComponent::Coordinator,
                        "refresh_skipped",
                        "session refresh skipped due to backoff",
                        retry_after_ms = retry_after_ms
                    );
                    return RefreshOutcome::failed(RefreshError::Skipped { retry_after_ms });
                }

                // Recorded before the call so a crash mid-refresh still counts.
                let now = self.inner.clock.now_ms();
                self.inner
                    .persist("record_attempt", || state.set_last_refresh_ms(now));
                self.inner
                    .persist("mark_in_progress", || state.set_in_progress(true));

                let inner = Arc::clone(&self.inner);
                let shared = async move { inner.run_refresh(state).await }
                    .boxed()
                    .shared();
                *slot = Some(shared.clone());
                shared
            }
        };

        refresh.await
    }

    /// Current session, refreshing only when needed and allowed.
    ///
    /// `force_refresh` goes straight to [`Self::refresh_session`], which still
    /// honours backoff.
    pub async fn get_session_with_refresh(&self, force_refresh: bool) -> RefreshOutcome {
        if self.inner.state.is_none() {
            return RefreshOutcome::empty();
        }
        if force_refresh {
            return self.refresh_session().await;
        }

        if let Some(pending) = self.inner.pending_refresh() {
            return pending.await;
        }

        match self.inner.provider.get_session().await {
            Ok(Some(session)) => RefreshOutcome::with_session(session),
            Ok(None) => {
                // A refresh may have started while the provider was answering.
                if let Some(pending) = self.inner.pending_refresh() {
                    pending.await
                } else if self.can_refresh() {
                    self.refresh_session().await
                } else {
                    RefreshOutcome::empty()
                }
            }
            Err(error) => {
                lwarn!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "get_session",
                    "failed to read current session",
                    error = %error
                );
                RefreshOutcome::failed(RefreshError::Failed { error })
            }
        }
    }

    /// Sign out at the provider and clear throttle state.
    ///
    /// Local state is cleared even when the provider call fails.
    pub async fn sign_out(&self) -> Result<(), IdentityError> {
        let result = self.inner.provider.sign_out().await;
        if let Some(state) = &self.inner.state {
            self.inner.persist("clear_state", || state.clear());
        }
        self.inner.lock_in_flight().take();

        match &result {
            Ok(()) => linfo!(
                LOG_ID,
                LogStage::Authentication,
                LogComponent::Coordinator,
                "sign_out",
                "signed out"
            ),
            Err(e) => lwarn!(
                LOG_ID,
                LogStage::Authentication,
                LogComponent::Coordinator,
                "sign_out",
                "provider sign-out failed, local state cleared",
                error = %e
            ),
        }
        result
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_refresh(&self) -> Option<InFlight> {
        self.lock_in_flight().clone()
    }

    /// Milliseconds left in the backoff window, or `None` if a refresh may run.
    fn remaining_backoff_ms(&self, state: &RefreshStateStore) -> Option<u64> {
        let last = match state.last_refresh_ms() {
            Ok(Some(last)) => last,
            Ok(None) => return None,
            Err(e) => {
                lwarn!(
                    LOG_ID,
                    LogStage::Storage,
                    LogComponent::Coordinator,
                    "read_last_refresh",
                    "unreadable refresh timestamp, allowing refresh",
                    error = %e
                );
                return None;
            }
        };
        let errors = state.error_count().unwrap_or_else(|e| {
            lwarn!(
                LOG_ID,
                LogStage::Storage,
                LogComponent::Coordinator,
                "read_error_count",
                "unreadable error count, assuming zero",
                error = %e
            );
            0
        });

        let jitter = self.jitter.sample(self.policy.max_jitter);
        let window = self.policy.backoff_window(errors, jitter);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let elapsed = (self.clock.now_ms() - last).max(0);

        if elapsed > window_ms {
            None
        } else {
            Some(u64::try_from(window_ms - elapsed).unwrap_or(0))
        }
    }

    async fn run_refresh(self: Arc<Self>, state: RefreshStateStore) -> RefreshOutcome {
        let timeout = self.policy.refresh_timeout;
        ldebug!(
            LOG_ID,
            LogStage::SessionRefresh,
            LogComponent::Coordinator,
            "refresh_start",
            "calling identity provider",
            timeout_ms = duration_ms(timeout)
        );

        let outcome = match tokio::time::timeout(timeout, self.provider.refresh_session()).await {
            Ok(Ok(session)) => {
                self.persist("reset_error_count", || state.set_error_count(0));
                linfo!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "refresh_success",
                    "session refreshed",
                    user_id = %session.user.id,
                    expires_at = session.expires_at
                );
                RefreshOutcome::with_session(session)
            }
            Ok(Err(error)) if self.classifier.is_throttling(&error) => {
                let count = state.error_count().unwrap_or(0).saturating_add(1);
                self.persist("escalate_backoff", || state.set_error_count(count));
                lwarn!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "refresh_throttled",
                    "identity provider throttled the refresh",
                    consecutive_errors = count,
                    error = %error
                );
                RefreshOutcome::failed(RefreshError::Throttled { error })
            }
            Ok(Err(error)) => {
                lwarn!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "refresh_failed",
                    "session refresh failed",
                    kind = ?error.kind,
                    error = %error
                );
                RefreshOutcome::failed(RefreshError::Failed { error })
            }
            Err(_) => {
                lwarn!(
                    LOG_ID,
                    LogStage::SessionRefresh,
                    LogComponent::Coordinator,
                    "refresh_timeout",
                    "session refresh timed out",
                    timeout_ms = duration_ms(timeout)
                );
                RefreshOutcome::failed(RefreshError::TimedOut {
                    timeout_ms: duration_ms(timeout),
                })
            }
        };

        self.persist("clear_in_progress", || state.set_in_progress(false));
        self.lock_in_flight().take();
        outcome
    }

    fn persist(&self, operation: &'static str, write: impl FnOnce() -> StorageResult<()>) {
        if let Err(e) = write() {
            lwarn!(
                LOG_ID,
                LogStage::Storage,
                LogComponent::StateStore,
                operation,
                "failed to persist refresh state",
                error = %e
            );
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
