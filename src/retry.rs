//! Retry policy for destination calls.
//!
//! A call failing with a retryable [`IntegrationError`] is attempted again
//! after an exponential backoff, up to `max_retries` extra times. Any other
//! error stops immediately.
//!
//! ```text
//! retry | delay (base 100ms, cap 10s)
//! ------|----------------------------
//!   1   | 100ms
//!   2   | 200ms
//!   3   | 400ms
//!  ...  | ...
//!   8+  | 10s
//! ```

use crate::integrations::IntegrationError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Largest doubling applied to the base delay.
const MAX_EXPONENT: u32 = 16;

/// The error of the last attempt, and how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: IntegrationError,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Fail on the first error, transient or not.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(MAX_EXPONENT);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails for good, or runs out of retries.
    ///
    /// Returns the number of attempts made on success.
    pub async fn run<F, Fut>(&self, mut call: F) -> Result<u32, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), IntegrationError>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match call().await {
                Ok(()) => return Ok(attempts),
                Err(error) if error.is_retryable() && attempts <= self.max_retries => {
                    let delay = self.backoff(attempts);
                    warn!(
                        attempt = attempts,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient destination error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(RetryFailure { error, attempts }),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn unavailable() -> IntegrationError {
        IntegrationError::Unavailable("503 Service Unavailable".into())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_default_does_not_retry() {
        assert_eq!(RetryPolicy::default().max_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.run(|| async { Ok(()) }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3);

        let attempts = policy
            .run(|| {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(unavailable())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(2);

        let failure = policy
            .run(|| {
                calls.set(calls.get() + 1);
                async { Err(unavailable()) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.get(), 3);
        assert!(failure.error.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_fails_on_transient_error() {
        let failure = RetryPolicy::none()
            .run(|| async { Err(unavailable()) })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Cell::new(0);
        let failure = RetryPolicy::new(5)
            .run(|| {
                calls.set(calls.get() + 1);
                async { Err(IntegrationError::Failed("some random error".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(failure.error.to_string(), "some random error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::new(2).with_base_delay(Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let _ = policy.run(|| async { Err(unavailable()) }).await;

        // 1s before the first retry, 2s before the second
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
