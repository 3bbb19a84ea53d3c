//! Typed access to the persisted session-refresh throttling fields.

use std::sync::Arc;

use serde::Serialize;

use super::{KeyValueStore, StorageError, StorageResult};

/// One of the three persisted throttling fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshField {
    /// When the last refresh attempt was recorded (ms since epoch).
    LastRefreshTimestamp,
    /// Refresh failures attributed to upstream throttling since the last success.
    ConsecutiveErrorCount,
    /// Best-effort marker that a refresh is outstanding.
    RefreshInProgress,
}

impl RefreshField {
    /// Storage key for this field.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::LastRefreshTimestamp => "pip.auth.lastRefreshTime",
            Self::ConsecutiveErrorCount => "pip.auth.refreshErrorCount",
            Self::RefreshInProgress => "pip.auth.refreshInProgress",
        }
    }

    /// All fields, in storage order.
    pub const ALL: [Self; 3] = [
        Self::LastRefreshTimestamp,
        Self::ConsecutiveErrorCount,
        Self::RefreshInProgress,
    ];
}

/// Point-in-time view of the throttling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSnapshot {
    /// Last attempt (ms since epoch)
    pub last_refresh_timestamp: Option<i64>,
    /// Consecutive throttling failures
    pub consecutive_error_count: u32,
    /// Persisted in-progress marker
    pub refresh_in_progress: bool,
}

/// Typed wrapper over a [`KeyValueStore`] for the throttling fields.
#[derive(Clone)]
pub struct RefreshStateStore {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for RefreshStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshStateStore").finish_non_exhaustive()
    }
}

impl RefreshStateStore {
    /// Wrap a key-value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn get_parsed<T: std::str::FromStr>(&self, field: RefreshField) -> StorageResult<Option<T>> {
        match self.store.get(field.key())? {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                StorageError::Corrupt(format!("{} holds unparsable value {raw:?}", field.key()))
            }),
        }
    }

    /// Last recorded refresh attempt, if any.
    pub fn last_refresh_ms(&self) -> StorageResult<Option<i64>> {
        self.get_parsed(RefreshField::LastRefreshTimestamp)
    }

    /// Record a refresh attempt time.
    pub fn set_last_refresh_ms(&self, timestamp_ms: i64) -> StorageResult<()> {
        self.store
            .set(RefreshField::LastRefreshTimestamp.key(), &timestamp_ms.to_string())
    }

    /// Consecutive throttling failures; missing means zero.
    pub fn error_count(&self) -> StorageResult<u32> {
        Ok(self
            .get_parsed(RefreshField::ConsecutiveErrorCount)?
            .unwrap_or(0))
    }

    /// Overwrite the consecutive failure count.
    pub fn set_error_count(&self, count: u32) -> StorageResult<()> {
        self.store
            .set(RefreshField::ConsecutiveErrorCount.key(), &count.to_string())
    }

    /// Whether the in-progress marker is set.
    pub fn in_progress(&self) -> StorageResult<bool> {
        Ok(self
            .store
            .get(RefreshField::RefreshInProgress.key())?
            .is_some_and(|raw| raw == "true"))
    }

    /// Set or clear the in-progress marker.
    pub fn set_in_progress(&self, in_progress: bool) -> StorageResult<()> {
        if in_progress {
            self.store.set(RefreshField::RefreshInProgress.key(), "true")
        } else {
            self.remove(RefreshField::RefreshInProgress)
        }
    }

    /// Delete one field.
    pub fn remove(&self, field: RefreshField) -> StorageResult<()> {
        self.store.remove(field.key())
    }

    /// Delete every field.
    pub fn clear(&self) -> StorageResult<()> {
        for field in RefreshField::ALL {
            self.remove(field)?;
        }
        Ok(())
    }

    /// Read all three fields, falling back to defaults for unreadable ones.
    #[must_use]
    pub fn snapshot(&self) -> RefreshSnapshot {
        RefreshSnapshot {
            last_refresh_timestamp: self.last_refresh_ms().ok().flatten(),
            consecutive_error_count: self.error_count().unwrap_or(0),
            refresh_in_progress: self.in_progress().unwrap_or(false),
        }
    }
}
