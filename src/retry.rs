//! Retry of transiently failing remote calls.
//!
//! A call that times out or finds its peer busy is retried after a fixed
//! backoff, up to a bounded number of attempts. Any other failure, or a
//! transient one after the last attempt, is returned to the caller.

use crate::config::TimeoutConfig;
use crate::error::RpcError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_delay: Duration,
    /// Deadline of each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&TimeoutConfig> for RetryPolicy {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_delay: config.backoff(),
            call_timeout: config.call(),
        }
    }
}

/// Runs `call` under `policy`, re-invoking it after each transient failure.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    method: &str,
    mut call: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match timeout(policy.call_timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
                after: policy.call_timeout,
            }),
        };
        match outcome {
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    "{} failed ({}), retry {}/{}",
                    method, err, attempt, policy.max_retries
                );
                sleep(policy.backoff_delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_delay: Duration::from_millis(10),
            call_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_succeeds() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result = call_with_retry(&policy(), "getState", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RpcError::Busy("later".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_logic_gives_up() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<(), _> = call_with_retry(&policy(), "getState", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let result: Result<(), _> = call_with_retry(&policy(), "connect", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::Closed)
        })
        .await;
        assert_eq!(result, Err(RpcError::Closed));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policy_matches_timeout_defaults() {
        let from_config = RetryPolicy::from(&TimeoutConfig::default());
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.call_timeout, Duration::from_secs(30));
        assert_eq!(policy.max_retries, from_config.max_retries);
        assert_eq!(policy.call_timeout, from_config.call_timeout);
        assert_eq!(policy.backoff_delay, from_config.backoff_delay);
    }
}
