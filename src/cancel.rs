//! Cooperative cancellation shared by every blocking call and sleep in a run.
//!
//! Provider calls, backoff sleeps and inter-unit pacing are all raced
//! against the token with `tokio::select!`, and stage loops check it
//! between units, so a cancelled run stops at the next await point instead
//! of finishing a multi-minute rate-limit cool-down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Marker returned when a wait was interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for crate::error::PipelineError {
    fn from(_: Cancelled) -> Self {
        crate::error::PipelineError::Cancelled
    }
}

#[derive(Debug, Default)]
struct Inner {
    stop_requested: AtomicBool,
    notify: Notify,
}

/// Clonable handle; all clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every pending wait.
    pub fn cancel(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `fut` to completion unless cancelled first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert_eq!(token.sleep(Duration::from_secs(300)).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_long_sleep() {
        let token = CancelToken::new();
        let other = token.clone();
        let handle = tokio::spawn(async move { other.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), Err(Cancelled));
    }

    #[test]
    fn check_after_cancel() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));
        assert_eq!(
            tokio_test::block_on(token.run(async { 1 })),
            Err(Cancelled)
        );
    }
}
