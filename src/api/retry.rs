//! Bounded exponential backoff around port calls.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use crate::error::PortError;
use crate::trading::RuntimeConfig;

/// Retries transient port errors until the elapsed budget runs out;
/// anything else is returned on the first failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max_interval: Duration, max_elapsed: Duration) -> Self {
        Self {
            initial,
            max_interval,
            max_elapsed,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_initial_ms),
            Duration::from_millis(config.retry_max_interval_ms),
            Duration::from_secs(config.retry_max_elapsed_secs),
        )
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, PortError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        backoff::future::retry_notify(
            schedule,
            || {
                let attempt = operation();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: PortError, wait: Duration| {
                warn!(operation = what, error = %e, retry_in_ms = wait.as_millis() as u64, "Transient failure");
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = quick()
            .run("fetch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PortError::Network("timeout".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = quick()
            .run("order", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PortError::ExchangeRejected("bad quantity".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(PortError::ExchangeRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(20),
        );
        let result: Result<(), _> = policy
            .run("fetch", || async { Err(PortError::Network("down".to_string())) })
            .await;
        assert!(matches!(result, Err(PortError::Network(_))));
    }
}
