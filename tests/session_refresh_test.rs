//! # 会话刷新集成测试
//!
//! Backoff, escalation and single-flight behaviour of the refresh coordinator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MINUTE_MS, ScriptedProvider, T0, coordinator, session, throttled};
use futures::future::join_all;
use pip_tracker::clock::ManualClock;
use pip_tracker::identity::{IdentityError, IdentityErrorKind};
use pip_tracker::session::{RefreshError, RefreshOutcome};
use pip_tracker::storage::{FileStore, KeyValueStore, MemoryStore, RefreshSnapshot};
use pretty_assertions::assert_eq;

fn memory() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn refresh_inside_backoff_window_makes_no_call() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    assert!(coordinator.refresh_session().await.session.is_some());

    for _ in 0..5 {
        clock.advance_ms(MINUTE_MS);
        let outcome = coordinator.refresh_session().await;
        assert!(matches!(outcome.error, Some(RefreshError::Skipped { .. })));
        assert_eq!(outcome.session, None);
    }
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn can_refresh_flips_after_window_including_jitter() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    let coordinator = coordinator(provider, memory(), &clock, 30_000);

    assert!(coordinator.can_refresh());
    coordinator.refresh_session().await;
    assert!(!coordinator.can_refresh());

    // Window is 10 minutes plus 30 seconds of jitter.
    clock.advance_ms(10 * MINUTE_MS + 30_000);
    assert!(!coordinator.can_refresh());
    clock.advance_ms(1);
    assert!(coordinator.can_refresh());
}

#[tokio::test]
async fn throttling_escalates_backoff_until_success() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    provider.then(Err(throttled())).then(Err(throttled()));
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    let first = coordinator.refresh_session().await;
    assert!(matches!(first.error, Some(RefreshError::Throttled { .. })));
    assert_eq!(coordinator.refresh_state().consecutive_error_count, 1);

    // One error: 11 minutes.
    clock.advance_ms(11 * MINUTE_MS);
    assert_eq!(coordinator.refresh_session().await.retry_after_ms(), Some(0));
    clock.advance_ms(1);
    let second = coordinator.refresh_session().await;
    assert!(matches!(second.error, Some(RefreshError::Throttled { .. })));
    assert_eq!(coordinator.refresh_state().consecutive_error_count, 2);

    // Two errors: 12 minutes.
    clock.advance_ms(12 * MINUTE_MS);
    assert!(!coordinator.can_refresh());
    clock.advance_ms(1);
    let third = coordinator.refresh_session().await;
    assert!(third.session.is_some());
    assert_eq!(coordinator.refresh_state().consecutive_error_count, 0);
    assert_eq!(provider.refresh_calls(), 3);
}

#[tokio::test]
async fn throttling_detected_from_message_text() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    provider.then(Err(IdentityError::new(
        IdentityErrorKind::Upstream,
        "Too Many Requests",
    )));
    let coordinator = coordinator(provider, memory(), &clock, 0);

    coordinator.refresh_session().await;

    assert_eq!(coordinator.refresh_state().consecutive_error_count, 1);
}

#[tokio::test]
async fn backoff_is_capped_at_thirty_minutes() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    let store = memory();
    let state = pip_tracker::storage::RefreshStateStore::new(store.clone());
    state.set_last_refresh_ms(T0).unwrap();
    state.set_error_count(1_000).unwrap();
    let coordinator = coordinator(provider, store, &clock, 30_000);

    clock.advance_ms(30 * MINUTE_MS);
    assert!(!coordinator.can_refresh());
    clock.advance_ms(1);
    assert!(coordinator.can_refresh());
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_call() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::from_millis(200));
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    let outcomes = join_all((0..5).map(|_| {
        let coordinator = coordinator.clone();
        async move { coordinator.refresh_session().await }
    }))
    .await;

    assert_eq!(provider.refresh_calls(), 1);
    let expected = RefreshOutcome::with_session(session("1"));
    for outcome in outcomes {
        assert_eq!(outcome, expected);
    }
    assert!(!coordinator.is_refresh_in_progress());
}

#[tokio::test(start_paused = true)]
async fn concurrent_session_reads_without_session_refresh_once() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::from_millis(200));
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    let outcomes = join_all((0..5).map(|_| coordinator.get_session_with_refresh(false))).await;

    assert_eq!(provider.refresh_calls(), 1);
    assert!(outcomes.iter().all(|o| o.session == Some(session("1"))));
}

#[tokio::test(start_paused = true)]
async fn slow_session_lookups_join_the_refresh_started_meanwhile() {
    let clock = ManualClock::new(T0);
    let provider =
        ScriptedProvider::with_lookup_delay(Duration::from_millis(200), Duration::from_millis(10));
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    let outcomes = join_all((0..5).map(|_| coordinator.get_session_with_refresh(false))).await;

    assert_eq!(provider.refresh_calls(), 1);
    let expected = RefreshOutcome::with_session(session("1"));
    for outcome in outcomes {
        assert_eq!(outcome, expected);
    }
}

#[tokio::test]
async fn held_session_is_returned_without_refresh() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    provider.hold(Some(session("held")));
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    let outcome = coordinator.get_session_with_refresh(false).await;

    assert_eq!(outcome, RefreshOutcome::with_session(session("held")));
    assert_eq!(provider.refresh_calls(), 0);
}

#[tokio::test]
async fn missing_session_inside_backoff_is_empty() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::ZERO);
    let coordinator = coordinator(provider.clone(), memory(), &clock, 0);

    coordinator.refresh_session().await;
    provider.hold(None);
    clock.advance_ms(MINUTE_MS);

    assert_eq!(
        coordinator.get_session_with_refresh(false).await,
        RefreshOutcome::empty()
    );
    let forced = coordinator.get_session_with_refresh(true).await;
    assert!(forced.retry_after_ms().is_some());
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out_without_escalation() {
    let clock = ManualClock::new(T0);
    let provider = ScriptedProvider::new(Duration::from_secs(120));
    let coordinator = coordinator(provider, memory(), &clock, 0);

    let outcome = coordinator.refresh_session().await;

    assert_eq!(
        outcome.error,
        Some(RefreshError::TimedOut { timeout_ms: 30_000 })
    );
    assert_eq!(
        coordinator.refresh_state(),
        RefreshSnapshot {
            last_refresh_timestamp: Some(T0),
            consecutive_error_count: 0,
            refresh_in_progress: false,
        }
    );
}

#[tokio::test]
async fn backoff_survives_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let clock = ManualClock::new(T0);

    let provider = ScriptedProvider::new(Duration::ZERO);
    let first = coordinator(provider.clone(), Arc::new(FileStore::new(&path)), &clock, 0);
    first.refresh_session().await;
    drop(first);

    clock.advance_ms(5 * MINUTE_MS);
    let restarted = coordinator(provider.clone(), Arc::new(FileStore::new(&path)), &clock, 0);

    assert!(!restarted.can_refresh());
    assert_eq!(restarted.refresh_session().await.retry_after_ms(), Some(300_000));
    assert_eq!(provider.refresh_calls(), 1);
}

#[tokio::test]
async fn without_storage_nothing_reaches_the_network() {
    let provider = ScriptedProvider::new(Duration::ZERO);
    let coordinator = pip_tracker::SessionRefreshCoordinator::new(
        provider.clone(),
        None,
        pip_tracker::session::RefreshPolicy::default(),
    );

    for force in [false, true] {
        assert_eq!(
            coordinator.get_session_with_refresh(force).await,
            RefreshOutcome::empty()
        );
    }
    assert_eq!(provider.refresh_calls(), 0);
}
