//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, GatewayError};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, before jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let secs = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Execute a gateway operation with retry.
    ///
    /// Non-retryable errors and exhaustion both map to
    /// [`AgentError::ModelUnavailable`]. Cancellation is honoured while
    /// backing off. `on_retry` observes each scheduled retry.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, Duration, &GatewayError),
        mut operation: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt + 1 >= max_attempts {
                return Err(AgentError::ModelUnavailable {
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let mut delay = jittered(self.backoff_for(attempt));
            if let GatewayError::RateLimited { retry_after: Some(hint) } = &err {
                delay = delay.max(*hint).min(self.max_backoff);
            }

            tracing::warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retrying model call"
            );
            on_retry(attempt + 1, delay, &err);

            tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Jitter: 75%–125% of backoff
fn jittered(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_secs_f64(backoff.as_secs_f64() * factor)
}

/// Wrap a gateway future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(750) && d < Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result = fast_policy(3)
            .execute(
                &CancellationToken::new(),
                |attempt, _, _| retries.push(attempt),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::Transport("reset".into()))
                    } else {
                        Ok("ok")
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_exhaustion_maps_to_model_unavailable() {
        let result: Result<(), _> = fast_policy(2)
            .execute(&CancellationToken::new(), |_, _, _| {}, || async {
                Err(GatewayError::RateLimited { retry_after: None })
            })
            .await;
        assert!(matches!(result, Err(AgentError::ModelUnavailable { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .execute(&CancellationToken::new(), |_, _, _| {}, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::MalformedResponse("garbage".into()))
            })
            .await;
        assert!(matches!(result, Err(AgentError::ModelUnavailable { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = RetryPolicy::default()
            .execute(&cancel, |_, _, _| {}, || async {
                Err(GatewayError::Transport("down".into()))
            })
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, GatewayError>(())
        };
        let result = with_timeout(Duration::from_secs(1), slow).await;
        assert_eq!(result, Err(GatewayError::Timeout(Duration::from_secs(1))));
    }
}
