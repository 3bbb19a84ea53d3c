//! # 限流集成测试
//!
//! Admission, key isolation and window expiry through the public limiter API.

use std::sync::Arc;

use pip_tracker::clock::{Clock, ManualClock};
use pip_tracker::config::RedisConfig;
use pip_tracker::rate_limit::{
    BackendKind, LimiterConfig, LocalBackend, RateLimiter, create_limiter,
};
use rstest::rstest;

const T0: i64 = 1_700_000_000_000;

fn local_limiter(limit: u32, window_secs: u64) -> (ManualClock, RateLimiter) {
    let clock = ManualClock::new(T0);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let limiter = RateLimiter::new(
        LimiterConfig::new("test", limit, window_secs),
        Arc::new(LocalBackend::with_clock(shared.clone())),
    )
    .with_clock(shared);
    (clock, limiter)
}

#[tokio::test]
async fn fourth_request_in_window_is_rejected() {
    let (_, limiter) = local_limiter(3, 60);

    for expected_remaining in [2, 1, 0] {
        let result = limiter.limit("user").await;
        assert!(result.success);
        assert!(!result.rate_limited);
        assert_eq!(result.remaining, expected_remaining);
    }

    let fourth = limiter.limit("user").await;
    assert!(!fourth.success);
    assert!(fourth.rate_limited);
    assert!(fourth.retry_after_seconds.is_some_and(|s| s > 0));
}

#[rstest]
#[case("A", "B")]
#[case("user-1", "anonymous")]
#[tokio::test]
async fn keys_do_not_share_quota(#[case] first: &str, #[case] second: &str) {
    let (_, limiter) = local_limiter(3, 60);

    for _ in 0..3 {
        assert!(limiter.limit(first).await.success);
    }
    assert!(limiter.limit(first).await.rate_limited);

    for _ in 0..3 {
        assert!(limiter.limit(second).await.success);
    }
}

#[tokio::test]
async fn sustained_abuse_is_rejected_within_the_hour() {
    let (clock, limiter) = local_limiter(10, 3600);

    for _ in 0..10 {
        assert!(limiter.limit("abuser").await.success);
        clock.advance_ms(1_000);
    }

    let eleventh = limiter.limit("abuser").await;
    assert!(eleventh.rate_limited);
    let retry_after = eleventh.retry_after_seconds.unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    assert_eq!(retry_after, 3600 - 10);
}

#[tokio::test]
async fn quota_returns_as_the_window_slides() {
    let (clock, limiter) = local_limiter(2, 60);

    limiter.limit("k").await;
    clock.advance_ms(20_000);
    limiter.limit("k").await;
    assert!(limiter.limit("k").await.rate_limited);

    // First hit expires at T0 + 60s, second one is still counted.
    clock.advance_ms(40_000);
    let result = limiter.limit("k").await;
    assert!(result.success);
    assert_eq!(result.remaining, 0);
    assert_eq!(result.reset, T0 + 80_000);
}

#[tokio::test]
async fn factory_builds_local_backend_without_redis() {
    let limiter = create_limiter(LimiterConfig::new("transcribe", 5, 60), None)
        .await
        .unwrap();
    assert_eq!(limiter.backend_name(), "local");
    assert!(limiter.limit("user").await.success);
}

#[tokio::test]
#[ignore = "requires a running redis at REDIS_URL"]
async fn shared_backend_enforces_limit_across_limiters() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".into());
    let redis = RedisConfig {
        url,
        command_timeout_ms: 2_000,
    };
    let identifier = format!("it-{}", uuid::Uuid::new_v4());
    let config = LimiterConfig::new(identifier, 3, 60).with_backend(BackendKind::Shared);

    // Two limiters model two gateway instances sharing one window.
    let a = create_limiter(config.clone(), Some(&redis)).await.unwrap();
    let b = create_limiter(config, Some(&redis)).await.unwrap();

    assert!(a.limit("user").await.success);
    assert!(b.limit("user").await.success);
    assert!(a.limit("user").await.success);
    let fourth = b.limit("user").await;
    assert!(fourth.rate_limited);
    assert!(fourth.retry_after_seconds.is_some_and(|s| s > 0 && s <= 60));
}
