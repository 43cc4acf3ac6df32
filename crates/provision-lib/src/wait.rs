//! Bounded waiting with an injectable clock
//!
//! All waits in the workflow go through [`wait_until`], which polls a predicate
//! until it yields a value or the timeout elapses. The clock is a trait so
//! tests can run timeouts in virtual time.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Source of time for waits
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: sleeping advances time instantly
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Total virtual time slept so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|p| p.into_inner());
        *elapsed += duration;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Upper bound on any single wait, whatever the policy asks for
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

/// Timeout and poll interval of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Outcome of [`wait_until`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            WaitOutcome::Ready(value) => Some(value),
            WaitOutcome::TimedOut => None,
        }
    }
}

/// Poll `check` until it returns `Some` or `policy.timeout` elapses.
///
/// `check` runs at least once. The timeout is capped at [`MAX_WAIT`] and the
/// final sleep is clamped so the wait never overshoots the deadline by more
/// than one check.
pub async fn wait_until<C, F, Fut, T>(clock: &C, policy: WaitPolicy, mut check: F) -> WaitOutcome<T>
where
    C: Clock + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = clock.now();
    let deadline = start
        .checked_add(policy.timeout.min(MAX_WAIT))
        .unwrap_or(start);

    loop {
        if let Some(value) = check().await {
            return WaitOutcome::Ready(value);
        }

        let now = clock.now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }

        clock.sleep(policy.interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_ready_immediately_does_not_sleep() {
        let clock = ManualClock::new();
        let outcome = wait_until(
            &clock,
            WaitPolicy::new(Duration::from_secs(60), Duration::from_secs(2)),
            || async { Some(7) },
        )
        .await;

        assert_eq!(outcome, WaitOutcome::Ready(7));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_ready_after_polls() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let outcome = wait_until(
            &clock,
            WaitPolicy::new(Duration::from_secs(60), Duration::from_secs(2)),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { (n >= 4).then_some(n) }
            },
        )
        .await;

        assert_eq!(outcome.ready(), Some(4));
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_times_out_at_deadline() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let outcome: WaitOutcome<()> = wait_until(
            &clock,
            WaitPolicy::new(Duration::from_secs(5), Duration::from_secs(2)),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            },
        )
        .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
        // checks at t=0, 2, 4 and 5
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_capped() {
        let clock = ManualClock::new();

        let outcome: WaitOutcome<()> = wait_until(
            &clock,
            WaitPolicy::new(Duration::MAX, Duration::from_secs(3600)),
            || async { None },
        )
        .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(clock.elapsed(), MAX_WAIT);
    }

    #[tokio::test]
    async fn test_zero_timeout_checks_once() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);

        let outcome: WaitOutcome<()> = wait_until(
            &clock,
            WaitPolicy::new(Duration::ZERO, Duration::from_secs(1)),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            },
        )
        .await;

        assert!(!outcome.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        let clock = SystemClock;
        let before = clock.now();
        clock.sleep(Duration::from_millis(20)).await;
        assert!(clock.now() - before >= Duration::from_millis(20));
    }
}
