//! Bounded retry for fallible async operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// How many times an operation is attempted and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op`, retrying errors that report themselves as retryable.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_when(label, Error::is_retryable, op).await
    }

    /// Run `op`, retrying any error accepted by `should_retry`.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// once attempts are exhausted.
    pub async fn run_when<T, F, Fut, P>(&self, label: &str, should_retry: P, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        error = %e,
                        "retrying after failure"
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let value = no_delay(3)
            .run("probe", |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::TransientNetwork { message: "reset".into() })
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let err = no_delay(3)
            .run("probe", |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::TransientNetwork { message: "reset".into() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientNetwork { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = &AtomicU32::new(0);
        let err = no_delay(3)
            .run("probe", |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Http { status: 403, url: "u".into() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { status: 403, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_numbers_are_passed_through() {
        let mut seen = Vec::new();
        let _ = no_delay(2)
            .run_when("probe", |_| true, |attempt| {
                seen.push(attempt);
                async { Err::<(), _>(Error::Format("bad".into())) }
            })
            .await;
        assert_eq!(seen, vec![1, 2]);
    }
}
