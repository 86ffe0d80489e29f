use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::error::FetchError;

/// Exponential backoff policy for provider requests: `base_delay` doubling
/// per retry, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy, clamping degenerate input.
    ///
    /// # Arguments
    /// * `max_attempts`: total attempts including the first, at least 1
    /// * `base_delay`: delay after the first failure, at least 1ms
    /// * `max_delay`: upper bound for any single delay, at least `base_delay`
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay slept after the `retry`-th failed attempt (0-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        let factor = 2_u32.saturating_pow(retry.min(31) as u32);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. `on_retry` sees every transient failure before the backoff
    /// sleep, which is where callers repair session state.
    pub async fn run<F, Fut, T, R, RFut>(&self, mut op: F, mut on_retry: R) -> Result<T, FetchError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
        R: FnMut(&FetchError) -> RFut,
        RFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure: {}",
                        err.cause
                    );
                    on_retry(&err).await;
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_new_clamps_degenerate_input() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(1));
        assert_eq!(policy.max_delay, Duration::from_millis(1));
    }

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (0..5).map(|retry| policy.delay_for(retry)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500));
        assert_eq!(delays[4], Duration::from_millis(500));
        assert_eq!(policy.delay_for(200), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_transient_failures() {
        let base = Duration::from_millis(100);
        let policy = RetryPolicy::new(3, base, Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let result = policy
            .run(
                |attempt| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 {
                            Err(FetchError::transient("connection reset"))
                        } else {
                            Ok("payload")
                        }
                    }
                },
                |_| {
                    let retries = retries.clone();
                    async move {
                        retries.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= base + base * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> = policy
            .run(
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(FetchError::permanent("400 bad request"))
                    }
                },
                |_| async {},
            )
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> = policy
            .run(
                |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(FetchError::transient("503"))
                    }
                },
                |_| async {},
            )
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
