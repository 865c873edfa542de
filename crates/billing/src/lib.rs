// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Remit Billing Core
//!
//! Keeps the locally persisted subscription records consistent with the
//! external payment processor, which is the authoritative source of
//! truth and communicates only through asynchronous, at-least-once,
//! possibly out-of-order webhook notifications.
//!
//! ## Features
//!
//! - **Registration Assignment**: atomic, strictly increasing
//!   registration orders gating promotional pricing
//! - **Tier Policy**: order → {tier, price, trial} lookup
//! - **Webhook Reconciliation**: signature verification, typed event
//!   dispatch, renewal/cancellation disambiguation, idempotent state
//!   sync
//! - **Retry**: exponential backoff for transient failures, batch replay
//!   with per-event isolation
//! - **Consistency Audit**: drift detection against the processor and
//!   forced re-sync repair

pub mod audit;
pub mod client;
pub mod error;
pub mod events;
pub mod memory;
pub mod registration;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod tier;
pub mod webhooks;


// Audit
pub use audit::{ConsistencyAuditor, FieldDrift, SweepOutcome};

// Client
pub use client::{HttpProcessorClient, ProcessorClient, ProcessorConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    classify_update, parse_event, CheckoutState, CustomerState, Event, InvoiceState,
    SubscriptionState, UpdateKind, WebhookEvent,
};

// Memory store
pub use memory::MemoryStore;

// Registration
pub use registration::RegistrationAssigner;

// Retry
pub use retry::{retry_with_policy, BatchOutcome, RetryPolicy, RetryProcessor};

// Store
pub use store::PgStore;

// Subscription
pub use subscription::{
    map_processor_status, BillingStore, CounterStore, EventClaim, EventLedgerStore,
    NewSubscription, RegistrationCounter, Subscription, SubscriptionStatus, SubscriptionStore,
};

// Tier
pub use tier::{Tier, TierSchedule, TierTerms};

// Webhooks
pub use webhooks::{verify_signature, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub registration: RegistrationAssigner,
    pub webhooks: Arc<WebhookHandler>,
    pub retry: RetryProcessor,
    pub auditor: ConsistencyAuditor,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by
    /// Postgres and the live processor API.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = ProcessorConfig::from_env()?;
        let schedule = TierSchedule::from_env();
        let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool));
        let processor: Arc<dyn ProcessorClient> =
            Arc::new(HttpProcessorClient::new(config.clone()));

        Ok(Self::new(
            store,
            processor,
            config,
            schedule,
            RetryPolicy::default(),
        ))
    }

    /// Create a new billing service with explicit collaborators. Tests
    /// pass [`MemoryStore`] and a stub processor client here.
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn ProcessorClient>,
        config: ProcessorConfig,
        schedule: TierSchedule,
        retry_policy: RetryPolicy,
    ) -> Self {
        let webhooks = Arc::new(WebhookHandler::new(
            store.clone(),
            config,
            schedule.clone(),
        ));

        Self {
            registration: RegistrationAssigner::new(store.clone(), schedule),
            webhooks: webhooks.clone(),
            retry: RetryProcessor::new(webhooks, retry_policy),
            auditor: ConsistencyAuditor::new(store, processor),
        }
    }
}
