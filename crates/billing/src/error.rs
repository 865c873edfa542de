//! Billing error types
//!
//! One error enum for the whole crate. The `retryable()` classification
//! drives the retry wrapper: transient store/processor failures are worth
//! retrying, signature and payload rejections are not.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook payload/signature/secret mismatch. Rejected before any
    /// state mutation, surfaced as a client error, never retried.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// The payload parsed as JSON but did not match the expected event
    /// shape for its type.
    #[error("invalid event payload: {0}")]
    EventPayloadInvalid(String),

    /// No local subscription for the given processor subscription ref.
    /// Webhook handlers treat this as a logged no-op; administrative
    /// paths (audit, repair) surface it.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Sequencer or store failure during signup. The caller must not
    /// grant access without a subscription record.
    #[error("registration failed: {0}")]
    Registration(String),

    #[error("database error: {0}")]
    Database(String),

    /// Processor API failure (audit/repair re-fetch).
    #[error("processor error: {0}")]
    Processor(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Processor(err.to_string())
    }
}

impl BillingError {
    /// Whether a retry can plausibly succeed.
    ///
    /// Signature failures and malformed payloads will fail identically on
    /// every attempt; a missing local subscription cannot be resolved by
    /// retrying either. Store and processor failures are transient.
    pub fn retryable(&self) -> bool {
        match self {
            BillingError::Database(_) => true,
            BillingError::Processor(_) => true,
            BillingError::Internal(_) => true,
            BillingError::WebhookSignatureInvalid => false,
            BillingError::EventPayloadInvalid(_) => false,
            BillingError::SubscriptionNotFound(_) => false,
            BillingError::Registration(_) => false,
        }
    }
}
