//! In-memory store implementation
//!
//! Backs tests and local development. Mirrors the Postgres store's
//! semantics closely enough to exercise the reconciler: unique
//! constraints on `user_id`, `registration_order` and
//! `processor_subscription_ref`, an atomic counter, and the event-ledger
//! claim rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscription::{
    CounterStore, EventClaim, EventLedgerStore, NewSubscription, RegistrationCounter,
    Subscription, SubscriptionStore,
};

#[derive(Debug, Clone)]
struct LedgerEntry {
    event_type: String,
    outcome: String,
    error: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    counter: Mutex<Option<RegistrationCounter>>,
    events: Mutex<HashMap<String, LedgerEntry>>,
    /// Test knob: when set, the counter behaves like an unavailable
    /// store so registration failure paths can be exercised.
    counter_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_counter_unavailable(&self, unavailable: bool) {
        self.counter_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Number of subscriptions held, for test assertions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Ledger entry as `(event_type, outcome, error)`, for test assertions.
    pub async fn ledger_entry(&self, event_id: &str) -> Option<(String, String, Option<String>)> {
        self.events
            .lock()
            .await
            .get(event_id)
            .map(|e| (e.event_type.clone(), e.outcome.clone(), e.error.clone()))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create(&self, new: NewSubscription) -> BillingResult<Subscription> {
        let mut subs = self.subscriptions.lock().await;

        if subs.values().any(|s| s.user_id == new.user_id) {
            return Err(BillingError::Database(format!(
                "unique violation: subscription exists for user {}",
                new.user_id
            )));
        }
        if subs
            .values()
            .any(|s| s.registration_order == new.registration_order)
        {
            return Err(BillingError::Database(format!(
                "unique violation: registration_order {} taken",
                new.registration_order
            )));
        }

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            registration_order: new.registration_order,
            tier: new.tier,
            status: new.status,
            processor_customer_ref: None,
            processor_subscription_ref: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_end: None,
            created_at: now,
            updated_at: now,
        };
        subs.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subs = self.subscriptions.lock().await;
        Ok(subs.values().find(|s| s.user_id == user_id).cloned())
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subs = self.subscriptions.lock().await;
        Ok(subs
            .values()
            .find(|s| s.processor_subscription_ref.as_deref() == Some(subscription_ref))
            .cloned())
    }

    async fn update_billing_state(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut subs = self.subscriptions.lock().await;

        if let Some(taken) = subs.values().find(|s| {
            s.id != subscription.id
                && s.processor_subscription_ref.is_some()
                && s.processor_subscription_ref == subscription.processor_subscription_ref
        }) {
            return Err(BillingError::Database(format!(
                "unique violation: processor_subscription_ref already on subscription {}",
                taken.id
            )));
        }

        let existing = subs.get_mut(&subscription.id).ok_or_else(|| {
            BillingError::SubscriptionNotFound(subscription.id.to_string())
        })?;

        existing.status = subscription.status;
        existing.processor_customer_ref = subscription.processor_customer_ref.clone();
        existing.processor_subscription_ref = subscription.processor_subscription_ref.clone();
        existing.current_period_start = subscription.current_period_start;
        existing.current_period_end = subscription.current_period_end;
        existing.cancel_at_period_end = subscription.cancel_at_period_end;
        existing.trial_end = subscription.trial_end;
        existing.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_with_processor_refs(&self, limit: i64) -> BillingResult<Vec<Subscription>> {
        let subs = self.subscriptions.lock().await;
        let mut out: Vec<Subscription> = subs
            .values()
            .filter(|s| s.processor_subscription_ref.is_some())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.registration_order);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn next_order(&self) -> BillingResult<i64> {
        if self.counter_unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "counter store unavailable".to_string(),
            ));
        }

        let mut counter = self.counter.lock().await;
        let row = counter.get_or_insert_with(|| RegistrationCounter {
            current_count: 0,
            updated_at: OffsetDateTime::now_utc(),
        });
        row.current_count += 1;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(row.current_count)
    }

    async fn current(&self) -> BillingResult<Option<RegistrationCounter>> {
        Ok(self.counter.lock().await.clone())
    }
}

#[async_trait]
impl EventLedgerStore for MemoryStore {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        let mut events = self.events.lock().await;
        match events.get(event_id) {
            // Failed events may be re-claimed so redelivery and retry can
            // finish the job.
            Some(entry) if entry.outcome != "error" => Ok(EventClaim::Duplicate),
            _ => {
                events.insert(
                    event_id.to_string(),
                    LedgerEntry {
                        event_type: event_type.to_string(),
                        outcome: "processing".to_string(),
                        error: None,
                    },
                );
                Ok(EventClaim::Claimed)
            }
        }
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut events = self.events.lock().await;
        if let Some(entry) = events.get_mut(event_id) {
            entry.outcome = outcome.to_string();
            entry.error = error.map(|e| e.to_string());
        }
        Ok(())
    }
}
