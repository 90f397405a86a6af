//! Exponential backoff for transient failures.
//!
//! Errors opt in by implementing [`Retryable`]; anything that reports
//! `false` is returned to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Classifies an error as transient.
pub trait Retryable {
    /// Whether repeating the failed operation may succeed.
    fn is_retryable(&self) -> bool;
}

/// Backoff settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Set the retry count.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay ceiling.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disable jitter, mostly useful in tests.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Runs an async operation until it succeeds, fails permanently, or
/// exhausts its retries.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Build a policy from `config`.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay to wait before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let secs = if self.config.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_secs_f64(secs)
    }

    /// Whether `error` seen on `attempt` deserves another try.
    #[must_use]
    pub fn should_retry<E: Retryable>(&self, error: &E, attempt: u32) -> bool {
        attempt < self.config.max_retries && error.is_retryable()
    }

    /// Run `operation`, retrying retryable failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns the first permanent error, or the last transient one once
    /// retries are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(&error, attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Configured retry count.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum Failure {
        Busy,
        Fatal,
    }

    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for Failure {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Busy)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default()
                .without_jitter()
                .with_initial_delay(Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let policy = RetryPolicy::new(RetryConfig::default().without_jitter());

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .without_jitter()
                .with_max_delay(Duration::from_millis(150)),
        );
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(150));
    }

    #[test]
    fn test_should_retry_respects_limit_and_kind() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(&Failure::Busy, 0));
        assert!(policy.should_retry(&Failure::Busy, 2));
        assert!(!policy.should_retry(&Failure::Busy, 3));
        assert!(!policy.should_retry(&Failure::Fatal, 0));
    }

    proptest::proptest! {
        #[test]
        fn prop_delay_never_exceeds_jittered_ceiling(attempt in 0u32..64) {
            let policy = RetryPolicy::default();
            let ceiling = RetryConfig::default().max_delay.mul_f64(1.25);
            proptest::prop_assert!(policy.delay_for_attempt(attempt) <= ceiling);
        }
    }

    #[tokio::test]
    async fn test_execute_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Failure::Busy)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_stops_on_permanent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Failure> = fast_policy()
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Fatal)
            })
            .await;

        assert!(matches!(result, Err(Failure::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Failure> = fast_policy()
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Busy)
            })
            .await;

        assert!(matches!(result, Err(Failure::Busy)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
