//! Subscription records and store contracts
//!
//! One subscription per account. The record is created once at
//! registration, mutated only by the webhook reconciler (or an explicit
//! repair), and never deleted — cancellation is a status.
//!
//! ## Status lifecycle
//!
//! ```text
//! incomplete -> trialing -> active <-> past_due -> canceled
//!                              \----> unpaid ----/
//! ```
//!
//! `canceled` is terminal. Free-tier subscriptions stay `active` forever
//! and never receive processor events. Transitions are driven by inbound
//! processor events; the reconciler recomputes the full target state from
//! each event and writes it unconditionally, so re-delivery converges.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::tier::Tier;

/// Local subscription status, mirroring the processor vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// `canceled` admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Whether the account behind this subscription should have product
    /// access. Consumed by the dashboard/access-gating layer.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw processor status string to the local status.
///
/// Unrecognized statuses map to `active`: the processor is authoritative
/// and locking a paying customer out over a vocabulary gap is worse than
/// granting a stale one access. The WARN below is the alerting hook for
/// that fallback.
pub fn map_processor_status(raw: &str) -> SubscriptionStatus {
    match raw {
        "trialing" => SubscriptionStatus::Trialing,
        "active" => SubscriptionStatus::Active,
        "past_due" => SubscriptionStatus::PastDue,
        "canceled" => SubscriptionStatus::Canceled,
        "unpaid" => SubscriptionStatus::Unpaid,
        "incomplete" => SubscriptionStatus::Incomplete,
        other => {
            tracing::warn!(
                processor_status = %other,
                "Unmapped processor status - failing open to active"
            );
            SubscriptionStatus::Active
        }
    }
}

/// Persisted subscription entity, 1:1 with an account.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Strictly increasing position number assigned at signup; unique
    /// across all subscriptions, gaps allowed after failed registrations.
    pub registration_order: i64,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub processor_customer_ref: Option<String>,
    pub processor_subscription_ref: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields written by the registration assigner at creation.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub registration_order: i64,
    pub tier: Tier,
    pub status: SubscriptionStatus,
}

/// Singleton counter row backing the registration sequencer.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationCounter {
    pub current_count: i64,
    pub updated_at: OffsetDateTime,
}

/// Subscription persistence contract.
///
/// Every write is a single statement against the store; row-level
/// atomicity there is the only concurrency control the reconciler needs.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, new: NewSubscription) -> BillingResult<Subscription>;

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Overwrite all reconciler-owned fields of an existing record in one
    /// statement. Immutable fields (`user_id`, `registration_order`,
    /// `tier`, `created_at`) are never touched.
    async fn update_billing_state(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Subscriptions that hold a processor subscription ref, for the
    /// consistency audit sweep.
    async fn list_with_processor_refs(&self, limit: i64) -> BillingResult<Vec<Subscription>>;
}

/// Registration sequence contract: atomic increment-and-return.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Return the next registration order. Concurrent callers never
    /// observe the same value; the increment must be one atomic statement
    /// evaluated by the store, not read-modify-write in caller memory.
    async fn next_order(&self) -> BillingResult<i64>;

    async fn current(&self) -> BillingResult<Option<RegistrationCounter>>;
}

/// Outcome of attempting to claim a webhook event for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller holds exclusive processing rights.
    Claimed,
    /// The event was already processed (or is being processed); skip it.
    Duplicate,
}

/// Ledger of processed webhook events.
///
/// The processor delivers at-least-once; the ledger's atomic claim keeps
/// duplicate deliveries from re-running handlers. Handlers are idempotent
/// regardless, so the ledger is a fast path, not a correctness
/// requirement.
#[async_trait]
pub trait EventLedgerStore: Send + Sync {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim>;

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()>;
}

/// Everything the billing services need from persistence.
pub trait BillingStore: SubscriptionStore + CounterStore + EventLedgerStore {}

impl<T: SubscriptionStore + CounterStore + EventLedgerStore> BillingStore for T {}
