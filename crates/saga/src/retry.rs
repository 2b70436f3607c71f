//! Bounded retries for saga step calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SagaError};

/// Timeout and backoff applied to every call a saga step makes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Deadline for a single attempt. An attempt past it counts as failed.
    pub step_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            step_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let max = self.max_delay.as_millis() as f64;
        let delay = (base * self.backoff_multiplier.powi(retry as i32)).min(max);
        Duration::from_millis(delay as u64)
    }
}

/// Runs `op` under the step timeout, retrying timeouts and retryable errors
/// with exponential backoff.
///
/// Business errors return immediately. When attempts run out the last error is
/// returned, or [`SagaError::StepTimeout`] if the last attempt timed out.
pub async fn run_step<T, E, F, Fut>(step: &'static str, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<SagaError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match tokio::time::timeout(config.step_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                let error: SagaError = e.into();
                if !error.is_retryable() || attempt >= max_attempts {
                    return Err(error);
                }
                tracing::warn!(step, attempt, error = %error, "saga step call failed, retrying");
            }
            Err(_) => {
                metrics::counter!("saga_step_timeouts_total", "step" => step).increment(1);
                if attempt >= max_attempts {
                    return Err(SagaError::StepTimeout {
                        step,
                        attempts: attempt,
                    });
                }
                tracing::warn!(step, attempt, timeout = ?config.step_timeout, "saga step call timed out, retrying");
            }
        }
        tokio::time::sleep(config.delay_for(attempt - 1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            step_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(20), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = &AtomicU32::new(0);

        let value = run_step("TEST", &fast(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".into()))
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
    async fn business_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);

        let result: Result<()> = run_step("TEST", &fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SagaError::InvalidOrder("no lines".into()))
        })
        .await;

        assert!(matches!(result, Err(SagaError::InvalidOrder(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_timeouts_become_step_timeout() {
        let calls = &AtomicU32::new(0);

        let result: Result<()> = run_step("RESERVING_INVENTORY", &fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, SagaError>(())
        })
        .await;

        assert!(matches!(
            result,
            Err(SagaError::StepTimeout {
                step: "RESERVING_INVENTORY",
                attempts: 3
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
