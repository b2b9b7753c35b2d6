//! Bounded, retried calls to external collaborators

use crate::collaborators::CollaboratorError;
use crate::config::RetryPolicy;
use crate::valuation::error::{Stage, ValuationError};
use std::future::Future;
use tracing::warn;

/// Run `call` under the policy's timeout, retrying recoverable failures.
///
/// Timeouts count as recoverable. Backoff doubles after each failed attempt.
/// Running out of attempts that all timed out surfaces as `UpstreamTimeout`;
/// a terminal failure, or any other exhaustion, as `DataUnavailable`. Both
/// are non-fatal to the request.
pub async fn call_with_retry<T, F, Fut>(
    stage: Stage,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, ValuationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    let mut timeouts = 0;

    loop {
        attempt += 1;

        let failure = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(CollaboratorError::Terminal(msg))) => {
                return Err(ValuationError::unavailable(stage, msg));
            }
            Ok(Err(CollaboratorError::Recoverable(msg))) => msg,
            Err(_) => {
                timeouts += 1;
                format!("timed out after {:?}", policy.timeout)
            }
        };

        if attempt >= max_attempts {
            if timeouts == attempt {
                return Err(ValuationError::UpstreamTimeout { stage, attempts: attempt });
            }
            return Err(ValuationError::unavailable(
                stage,
                format!("{} (gave up after {} attempts)", failure, attempt),
            ));
        }

        let delay = policy.backoff * 2u32.saturating_pow(attempt - 1);
        warn!(
            "{} attempt {}/{} failed: {}; retrying in {:?}",
            stage, attempt, max_attempts, failure, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = call_with_retry(Stage::ModelRunner, &policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CollaboratorError::Recoverable("503".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = call_with_retry(Stage::DataProvider, &policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CollaboratorError::Terminal("404".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ValuationError::DataUnavailable { stage: Stage::DataProvider, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_into_upstream_timeout() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = call_with_retry(Stage::ModelRunner, &policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err, ValuationError::UpstreamTimeout { stage: Stage::ModelRunner, attempts: 3 });
        assert_eq!(err.to_string(), "ModelRunner: upstream timeout after 3 attempts");
        assert!(!err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mixed_failures_exhaust_into_data_unavailable() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = call_with_retry(Stage::DataProvider, &policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(CollaboratorError::Recoverable("connection reset".to_string()))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ValuationError::DataUnavailable { stage: Stage::DataProvider, .. }));
        assert!(err.to_string().contains("connection reset (gave up after 3 attempts)"));
    }
}
