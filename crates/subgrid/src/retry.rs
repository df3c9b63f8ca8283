//! Retry with exponential backoff, offered to callers.
//!
//! The engine itself never retries: `execute` returns the first outcome.
//! Callers that want retries wrap their own calls, typically with
//! `ServiceFailure::is_transient` as the predicate.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or
/// the policy runs out of attempts. Returns the last outcome.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && should_retry(&e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "[Retry] Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use subgrid_api::ServiceFailure;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for(40), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let attempts = AtomicU32::new(0);
        let outcome = retry_with_backoff(&RetryPolicy::default(), ServiceFailure::is_transient, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceFailure::remote(503, "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(outcome.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_return_immediately() {
        let attempts = AtomicU32::new(0);
        let outcome: Result<(), _> =
            retry_with_backoff(&RetryPolicy::default(), ServiceFailure::is_transient, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceFailure::remote(400, "bad request")) }
            })
            .await;

        assert_eq!(outcome.unwrap_err().status, Some(400));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let outcome: Result<(), _> = retry_with_backoff(&policy, |_: &ServiceFailure| true, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceFailure::transport("reset")) }
        })
        .await;

        assert!(outcome.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
