//! Bounded retry with exponential backoff and per-attempt timeouts

use crate::config::RetryConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use backoff::{future::retry_notify, ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// Retry policy for one collaborator call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            call_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.multiplier)
            // The attempt cap bounds the loop, not wall-clock time
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run one call under the timeout only
    pub async fn bounded<T, Fut>(&self, operation: &str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        };
        metrics::record_upstream(operation, started.elapsed().as_secs_f64(), result.is_ok());
        result
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt cap is hit
    ///
    /// Each attempt is bounded by the call timeout. Only transient errors
    /// (see [`AppError::is_transient`]) are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts;
        let mut attempt = 0u32;

        retry_notify(
            self.backoff(),
            || {
                attempt += 1;
                let current = attempt;
                let pending = self.bounded(operation, call());
                async move {
                    match pending.await {
                        Ok(value) => Ok(value),
                        Err(e) if e.is_transient() && current < max_attempts => {
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            },
            |err: AppError, wait: Duration| {
                warn!(
                    operation = %operation,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Transient failure, retrying"
                );
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy::from_config(
            &RetryConfig {
                max_attempts,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                multiplier: 2.0,
            },
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy(3, 500)
            .run("retrieval", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(AppError::upstream("retrieval", "503"))
                    } else {
                        Ok("evidence")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "evidence");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = policy(3, 500)
            .run("generation", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AppError::Configuration {
                        message: "401".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::Configuration { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_capped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = policy(3, 500)
            .run("generation", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::upstream("llm", "overloaded")) }
            })
            .await;

        assert!(matches!(result, Err(AppError::Upstream { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<()> = policy(2, 10)
            .run("retrieval", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(AppError::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "retrieval");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
