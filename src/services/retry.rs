//! Fixed-delay retry policy shared by every remote operation.
//!
//! Attempts are spaced by a constant delay and capped by a fixed count.

use std::{error::Error as StdError, future::Future, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Returned once an operation has failed for good.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E>
where
    E: StdError + 'static,
{
    pub operation: &'static str,
    pub attempts: u32,
    #[source]
    pub source: E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: StdError + Retryable + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        delay_ms = %self.delay.as_millis(),
                        "transient failure, will retry"
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(err) => {
                    warn!(
                        operation,
                        attempt,
                        transient = err.is_transient(),
                        error = %err,
                        "giving up"
                    );
                    return Err(RetryError {
                        operation,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Flaky(&'static str, bool);

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.1
        }
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_first_time_without_retrying() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = quick(3)
            .run("op", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Flaky>(7)
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = quick(5)
            .run("op", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Flaky("network", true))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_exactly_at_the_attempt_bound() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = quick(4)
            .run("push", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Flaky("down", true))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.operation, "push");
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = quick(5)
            .run("fetch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Flaky("not found", false))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
