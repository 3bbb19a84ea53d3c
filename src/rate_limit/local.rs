//! In-process sliding-log backend.
//!
//! Each key keeps the timestamps of its admitted hits. A hit prunes entries
//! older than the window, counts what is left and records itself if the
//! count is below the limit. The DashMap entry lock makes that atomic per key.
//! Counts live in this process only, so several gateway instances each
//! admit up to `limit`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::backend::{CountingBackend, WindowCount, window_ms};
use crate::clock::{Clock, system_clock};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// Default period of the idle-key sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
struct SlidingLog {
    window_ms: i64,
    hits: VecDeque<i64>,
}

impl SlidingLog {
    fn prune(&mut self, now_ms: i64) {
        let horizon = now_ms.saturating_sub(self.window_ms);
        while self.hits.front().is_some_and(|&t| t <= horizon) {
            self.hits.pop_front();
        }
    }
}

/// Sliding-window counter held in process memory.
#[derive(Clone)]
pub struct LocalBackend {
    logs: Arc<DashMap<String, SlidingLog>>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("keys", &self.logs.len())
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    /// Backend on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Backend on an explicit clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }

    /// Drop expired hits and forget keys with none left. Returns keys removed.
    pub fn sweep(&self) -> usize {
        sweep_logs(&self.logs, self.clock.now_ms())
    }

    /// Run [`Self::sweep`] every `interval` until the handle is stopped or dropped.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) -> SweeperHandle {
        let logs = Arc::clone(&self.logs);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep_logs(&logs, clock.now_ms());
                if removed > 0 {
                    ldebug!(
                        "system",
                        LogStage::RateLimit,
                        LogComponent::LocalBackend,
                        "sweep",
                        "removed idle rate limit keys",
                        removed = removed,
                        remaining = logs.len()
                    );
                }
            }
        });

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::LocalBackend,
            "sweeper_started",
            "local rate limit sweeper started",
            interval_secs = interval.as_secs()
        );
        SweeperHandle {
            handle: Some(handle),
        }
    }
}

fn sweep_logs(logs: &DashMap<String, SlidingLog>, now_ms: i64) -> usize {
    let before = logs.len();
    logs.retain(|_, log| {
        log.prune(now_ms);
        !log.hits.is_empty()
    });
    before.saturating_sub(logs.len())
}

#[async_trait]
impl CountingBackend for LocalBackend {
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowCount> {
        let now_ms = self.clock.now_ms();
        let window_ms = window_ms(window);

        let mut log = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| SlidingLog {
                window_ms,
                hits: VecDeque::new(),
            });
        log.window_ms = window_ms;
        log.prune(now_ms);

        let admitted = log.hits.len() < limit as usize;
        if admitted {
            log.hits.push_back(now_ms);
        }

        Ok(WindowCount {
            admitted,
            count: u32::try_from(log.hits.len()).unwrap_or(u32::MAX),
            oldest_ms: log.hits.front().copied(),
            now_ms,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Owner of the sweeper task; aborts it on [`Self::stop`] or drop.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Abort the sweeper task. Calling it again does nothing.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            linfo!(
                "system",
                LogStage::Shutdown,
                LogComponent::LocalBackend,
                "sweeper_stopped",
                "local rate limit sweeper stopped"
            );
        }
    }

    /// Whether the sweeper task is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000_000;
    const MINUTE: Duration = Duration::from_secs(60);

    fn backend() -> (ManualClock, LocalBackend) {
        let clock = ManualClock::new(T0);
        let backend = LocalBackend::with_clock(Arc::new(clock.clone()));
        (clock, backend)
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let (clock, backend) = backend();

        for i in 1..=3 {
            let count = backend.hit("k", 3, MINUTE).await.unwrap();
            assert!(count.admitted);
            assert_eq!(count.count, i);
            clock.advance_ms(1_000);
        }

        let rejected = backend.hit("k", 3, MINUTE).await.unwrap();
        assert_eq!(
            rejected,
            WindowCount {
                admitted: false,
                count: 3,
                oldest_ms: Some(T0),
                now_ms: T0 + 3_000,
            }
        );
    }

    #[tokio::test]
    async fn window_slides_per_hit() {
        let (clock, backend) = backend();
        backend.hit("k", 2, MINUTE).await.unwrap();
        clock.advance_ms(30_000);
        backend.hit("k", 2, MINUTE).await.unwrap();

        clock.advance_ms(29_999);
        assert!(!backend.hit("k", 2, MINUTE).await.unwrap().admitted);

        // The first hit leaves the window exactly one window after it was made.
        clock.advance_ms(1);
        let count = backend.hit("k", 2, MINUTE).await.unwrap();
        assert!(count.admitted);
        assert_eq!(count.oldest_ms, Some(T0 + 30_000));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (_, backend) = backend();
        assert!(backend.hit("a", 1, MINUTE).await.unwrap().admitted);
        assert!(backend.hit("b", 1, MINUTE).await.unwrap().admitted);
        assert!(!backend.hit("a", 1, MINUTE).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn sweep_forgets_idle_keys() {
        let (clock, backend) = backend();
        backend.hit("old", 5, MINUTE).await.unwrap();
        clock.advance_ms(45_000);
        backend.hit("fresh", 5, MINUTE).await.unwrap();
        clock.advance_ms(30_000);

        assert_eq!(backend.sweep(), 1);
        assert_eq!(backend.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_stopped() {
        let (clock, backend) = backend();
        backend.hit("k", 5, MINUTE).await.unwrap();
        clock.advance_ms(120_000);

        let mut sweeper = backend.start_sweeper(Duration::from_secs(10));
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(backend.tracked_keys(), 0);

        sweeper.stop();
        assert!(!sweeper.is_running());
    }
}
