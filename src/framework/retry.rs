use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that can tell the retry loop whether another attempt makes sense.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    /// Server-provided backoff hint (rate limits).
    fn retry_hint(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for crate::domain::errors::ExchangeError {
    fn is_transient(&self) -> bool {
        self.is_transient()
    }

    fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint()
    }
}

// Store errors are undifferentiated; treat them all as transient.
impl Retryable for anyhow::Error {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Bounded exponential backoff: base 500ms, factor 2, capped at 30s, with
/// full jitter. Rate-limit hints override the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (attempt is 1-based: the delay after the
    /// first failure is `delay(1)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jittered = rand::rng().random_range(0.0..=capped);
        Duration::from_millis(jittered as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. The last error is returned on escalation.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = e.retry_hint().unwrap_or_else(|| self.delay(attempt));
                    warn!(
                        "Retry: {} failed (attempt {}/{}): {}. Backing off {:?}",
                        op_name, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ExchangeError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, ExchangeError> = fast_policy()
            .run("op", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(ExchangeError::Network("reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, ExchangeError> = fast_policy()
            .run("op", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Rejected("min notional".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, ExchangeError> = fast_policy()
            .run("op", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ExchangeError::Network("reset".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 1..=10 {
            assert!(policy.delay(attempt) <= policy.max_delay);
        }
    }
}
