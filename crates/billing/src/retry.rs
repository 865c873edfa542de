//! Retry wrapper for event processing
//!
//! Wraps the reconciler with exponential backoff for transient failures
//! and gives batch replay per-event failure isolation. Retries block the
//! calling task for the backoff duration; callers that cannot block must
//! run this on a worker, not inline with request handling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::events::Event;
use crate::webhooks::WebhookHandler;

/// Backoff shape: `2^attempt * delay_factor` up to `max_delay`, for
/// `max_attempts` total attempts. The default factor of one second gives
/// 2s, 4s, 8s, ...; tests shrink it to keep wall time down.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay_factor: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_factor: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.delay_factor.as_millis() as u64)
            .max_delay(self.max_delay)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Run an operation under a retry policy. Only retryable errors are
/// retried; the last error is surfaced after exhaustion.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, operation: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    RetryIf::spawn(policy.backoff(), operation, |err: &BillingError| {
        let retry = err.retryable();
        if retry {
            tracing::warn!(error = %err, "Transient failure - will retry with backoff");
        }
        retry
    })
    .await
}

/// Result of replaying a batch of events.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// `(event_id, last_error)` for each exhausted event.
    pub errors: Vec<(String, BillingError)>,
}

/// Event processing with retry semantics layered on the reconciler.
pub struct RetryProcessor {
    handler: Arc<WebhookHandler>,
    policy: RetryPolicy,
}

impl RetryProcessor {
    pub fn new(handler: Arc<WebhookHandler>, policy: RetryPolicy) -> Self {
        Self { handler, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process one event, retrying transient failures with backoff.
    /// After exhaustion the last error is returned; dead-lettering is the
    /// caller's responsibility.
    pub async fn process_with_retry(&self, event: &Event) -> BillingResult<()> {
        retry_with_policy(&self.policy, || self.handler.handle_event(event)).await
    }

    /// Process each event independently, sequentially. One event
    /// exhausting its retries does not block the rest.
    pub async fn process_batch(&self, events: &[Event]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for event in events {
            match self.process_with_retry(event).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %event.id,
                        error = %e,
                        "Event failed after retry exhaustion"
                    );
                    outcome.failed += 1;
                    outcome.errors.push((event.id.clone(), e));
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Batch processing complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_factor: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let result = retry_with_policy(&fast_policy(5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BillingError::Database("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhaustion() {
        let attempts = AtomicUsize::new(0);
        let result: BillingResult<()> = retry_with_policy(&fast_policy(3), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(BillingError::Database(format!("attempt {}", n))) }
        })
        .await;

        match result.unwrap_err() {
            BillingError::Database(msg) => assert_eq!(msg, "attempt 2"),
            other => panic!("wrong error: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: BillingResult<()> = retry_with_policy(&fast_policy(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::WebhookSignatureInvalid) }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            BillingError::WebhookSignatureInvalid
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_respects_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            delay_factor: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        let delays: Vec<Duration> = policy.backoff().collect();

        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(delays[3], Duration::from_secs(10));
        assert_eq!(delays[4], Duration::from_secs(10));
    }
}
