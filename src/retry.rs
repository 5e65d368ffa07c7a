//! Bounded exponential backoff

use std::future::Future;
use std::time::Duration;

/// Retry policy for broker and callback operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: u32,
    /// Upper bound on a single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::broker_default()
    }
}

impl RetryPolicy {
    /// Subscribe/unsubscribe/publish: 3 attempts, 100ms, x2, capped at 2s
    pub fn broker_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Subscriber callbacks: 3 attempts, 50ms, x2
    pub fn callback_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
            max_backoff: Duration::from_secs(1),
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or attempts are exhausted
    ///
    /// `op` receives the 1-based attempt number. Returns the last result
    /// together with the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> (Result<T, E>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if attempt >= max => return (Err(err), attempt),
                Err(_) => {
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::broker_default();

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
    }

    #[test]
    fn test_builder_clamps() {
        let policy = RetryPolicy::none().max_attempts(0).multiplier(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = RetryPolicy::callback_default()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up() {
        let (result, attempts) = RetryPolicy::broker_default()
            .max_attempts(2)
            .run(|_| async { Err::<(), _>("down") })
            .await;

        assert_eq!(result, Err("down"));
        assert_eq!(attempts, 2);
    }
}
