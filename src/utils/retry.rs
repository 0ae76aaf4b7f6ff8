use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Exponential Backoff With Jitter
// ============================================================================
//
// delay(attempt) = min(base * multiplier^attempt, max) * (1 + U[0, jitter))
//
// Used for two things: spacing message redeliveries in the retry schedule,
// and riding out transient backing-store errors inside background loops.
//
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay for attempt 0
    pub base_delay: Duration,
    /// Ceiling applied before jitter
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Upper bound of the random stretch, as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Short policy for store round-trips inside background loops
    pub fn store_operations() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Capped delay before jitter
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay using the supplied random source
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let stretch: f64 = rng.gen_range(0.0..self.jitter_factor);
        capped.mul_f64(1.0 + stretch)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success(T),
    /// Operation failed after all attempts
    Failed(E),
    /// Operation failed with an error that retrying cannot fix
    PermanentFailure(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed(err) | RetryResult::PermanentFailure(err) => Err(err),
        }
    }
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

impl IsTransient for crate::error::HubError {
    fn is_transient(&self) -> bool {
        crate::error::HubError::is_transient(self)
    }
}

/// Retry transient failures with backoff, giving up after `max_attempts`
pub async fn retry_on_transient<F, Fut, T, E>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if !error.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        error = %error,
                        "Permanent failure detected, not retrying"
                    );
                    return RetryResult::PermanentFailure(error);
                }

                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt = attempt,
                        error = %error,
                        "Operation failed after all retries"
                    );
                    return RetryResult::Failed(error);
                }

                let delay = policy.delay(attempt - 1);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );

                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            jitter_factor: 0.5,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.capped_delay(0), Duration::from_millis(100));
        assert_eq!(p.capped_delay(1), Duration::from_millis(200));
        assert_eq!(p.capped_delay(2), Duration::from_millis(400));
        assert_eq!(p.capped_delay(10), Duration::from_millis(1_000));
        assert_eq!(p.capped_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            let floor = p.capped_delay(attempt);
            for _ in 0..50 {
                let delay = p.delay_with(attempt, &mut rng);
                assert!(delay >= floor);
                assert!(delay < floor.mul_f64(1.5));
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let p = BackoffPolicy {
            jitter_factor: 0.0,
            ..policy()
        };
        assert_eq!(p.delay(1), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_store_errors() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();
        let p = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };

        let result = retry_on_transient(&p, 3, "zadd", |_attempt| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HubError::Store("connection reset".into()))
                } else {
                    Ok("staged")
                }
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success("staged")));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();

        let result = retry_on_transient(&policy(), 5, "decode", |_attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HubError::InvalidArgument("bad record".into()))
            }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentFailure(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
