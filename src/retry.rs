//! One retry combinator for every call site.
//!
//! ## Retry Strategy
//!
//! A [`RetryPolicy`] is an attempt budget plus an exponential curve
//! (`initial_delay * multiplier^n`, capped at `max_delay`). The caller
//! decides which errors are worth another attempt through a predicate, so
//! the same loop drives the 60 s rate-limit schedule, the 10 s gateway
//! timeout schedule, and the short re-ask loop of single-call stages.
//! Sleeps go through the [`CancelToken`], so a cancelled run never waits out
//! a backoff.

use crate::cancel::{CancelToken, Cancelled};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Minimum 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Rate-limit schedule: 60 s, then ×1.5, capped at 180 s, three attempts.
    pub fn rate_limit() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(60),
            multiplier: 1.5,
            max_delay: Duration::from_secs(180),
        }
    }

    /// Gateway-timeout schedule: 10 s, then ×1.5, three attempts.
    pub fn timeout() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(10),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }

    /// A fixed pause between a small number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. `op` receives the 0-based attempt number.
///
/// The last error is returned unchanged when retries run out, so callers
/// can still tell *why* it failed.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    mut op: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: From<Cancelled> + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts && retryable(&e) => {
                attempt += 1;
                let delay = policy.delay_for(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms: {}",
                    label,
                    attempt,
                    max_attempts - 1,
                    delay.as_millis(),
                    e
                );
                cancel.sleep(delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[test]
    fn rate_limit_curve_is_capped() {
        let p = RetryPolicy::rate_limit();
        assert_eq!(p.delay_for(1), Duration::from_secs(60));
        assert_eq!(p.delay_for(2), Duration::from_secs(90));
        assert_eq!(p.delay_for(3), Duration::from_secs(135));
        assert_eq!(p.delay_for(4), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, TestError> = with_retry(
            &RetryPolicy::timeout(),
            &CancelToken::new(),
            "test",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |e| *e == TestError::Transient,
        )
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), TestError> = with_retry(
            &RetryPolicy::timeout(),
            &CancelToken::new(),
            "test",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Permanent) }
            },
            |e| *e == TestError::Transient,
        )
        .await;
        assert_eq!(out, Err(TestError::Permanent));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_returns_last_error() {
        let out: Result<(), TestError> = with_retry(
            &RetryPolicy::fixed(2, Duration::from_secs(1)),
            &CancelToken::new(),
            "test",
            |_| async { Err(TestError::Transient) },
            |_| true,
        )
        .await;
        assert_eq!(out, Err(TestError::Transient));
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let token = CancelToken::new();
        token.cancel();
        let out: Result<(), TestError> = with_retry(
            &RetryPolicy::timeout(),
            &token,
            "test",
            |_| async { Ok(()) },
            |_| true,
        )
        .await;
        assert_eq!(out, Err(TestError::Cancelled));
    }
}
