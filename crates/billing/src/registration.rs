//! Registration assignment
//!
//! Runs synchronously inside signup: draws the next registration order
//! from the sequencer, derives the tier terms for that position, and
//! creates the subscription record. If any step fails the signup flow
//! gets the error — an account must never come into existence without a
//! billing record behind it.
//!
//! The counter increment and the subscription insert are two statements,
//! not one transaction. A crash between them burns a counter value and
//! leaves a gap in the order sequence, which is fine; orders must be
//! unique and increasing, not contiguous.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscription::{BillingStore, NewSubscription, Subscription, SubscriptionStatus};
use crate::tier::{TierSchedule, TierTerms};

pub struct RegistrationAssigner {
    store: Arc<dyn BillingStore>,
    schedule: TierSchedule,
}

impl RegistrationAssigner {
    pub fn new(store: Arc<dyn BillingStore>, schedule: TierSchedule) -> Self {
        Self { store, schedule }
    }

    pub fn schedule(&self) -> &TierSchedule {
        &self.schedule
    }

    /// Draw the next registration order.
    pub async fn next_order(&self) -> BillingResult<i64> {
        self.store
            .next_order()
            .await
            .map_err(|e| BillingError::Registration(format!("sequencer failed: {}", e)))
    }

    /// Create the subscription record for a newly created account.
    ///
    /// Free-tier subscriptions need no payment setup and are born
    /// `active`; paid tiers stay `incomplete` until the first successful
    /// checkout flows back through the webhook reconciler.
    pub async fn assign(&self, user_id: Uuid) -> BillingResult<Subscription> {
        if let Some(existing) = self.store.find_by_user(user_id).await? {
            return Err(BillingError::Registration(format!(
                "user {} already has subscription {}",
                user_id, existing.id
            )));
        }

        let order = self.next_order().await?;
        let TierTerms {
            tier,
            monthly_price_cents,
            trial_days,
        } = self.schedule.terms_for(order);

        let status = if tier.requires_billing() {
            SubscriptionStatus::Incomplete
        } else {
            SubscriptionStatus::Active
        };

        let subscription = self
            .store
            .create(NewSubscription {
                user_id,
                registration_order: order,
                tier,
                status,
            })
            .await
            .map_err(|e| BillingError::Registration(format!("store write failed: {}", e)))?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            registration_order = order,
            tier = %tier,
            monthly_price_cents = monthly_price_cents,
            trial_days = trial_days,
            "Assigned subscription at registration"
        );

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::tier::Tier;

    fn tiny_schedule() -> TierSchedule {
        // FREE_MAX = 1, PROMOTIONAL_MAX = 3
        TierSchedule {
            free_max: 1,
            promotional_max: 3,
            promotional_price_cents: 500,
            standard_price_cents: 1500,
            promotional_trial_days: 90,
            standard_trial_days: 30,
        }
    }

    #[tokio::test]
    async fn first_account_gets_order_one_and_free_tier() {
        let store = Arc::new(MemoryStore::new());
        let assigner = RegistrationAssigner::new(store, tiny_schedule());

        let sub = assigner.assign(Uuid::new_v4()).await.unwrap();
        assert_eq!(sub.registration_order, 1);
        assert_eq!(sub.tier, Tier::Free);
        // Free tier requires no payment setup.
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn second_account_gets_order_two_and_promotional_tier() {
        let store = Arc::new(MemoryStore::new());
        let assigner = RegistrationAssigner::new(store, tiny_schedule());

        assigner.assign(Uuid::new_v4()).await.unwrap();
        let sub = assigner.assign(Uuid::new_v4()).await.unwrap();
        assert_eq!(sub.registration_order, 2);
        assert_eq!(sub.tier, Tier::Promotional);
        // Paid tier waits for checkout before any status progress.
        assert_eq!(sub.status, SubscriptionStatus::Incomplete);
    }

    #[tokio::test]
    async fn orders_pass_the_promotional_block_into_standard() {
        let store = Arc::new(MemoryStore::new());
        let assigner = RegistrationAssigner::new(store, tiny_schedule());

        let mut last = None;
        for _ in 0..5 {
            last = Some(assigner.assign(Uuid::new_v4()).await.unwrap());
        }
        let fifth = last.unwrap();
        assert_eq!(fifth.registration_order, 5);
        assert_eq!(fifth.tier, Tier::Standard);
    }

    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let assigner = RegistrationAssigner::new(store, tiny_schedule());

        let user = Uuid::new_v4();
        assigner.assign(user).await.unwrap();
        let err = assigner.assign(user).await.unwrap_err();
        assert!(matches!(err, BillingError::Registration(_)));
    }

    #[tokio::test]
    async fn sequencer_failure_surfaces_as_registration_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_counter_unavailable(true);
        let assigner = RegistrationAssigner::new(store.clone(), tiny_schedule());

        let err = assigner.assign(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::Registration(_)));
        // No orphaned subscription record.
        assert_eq!(store.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_assignments_receive_distinct_orders() {
        use tokio::sync::Barrier;

        const CALLERS: usize = 32;

        let store = Arc::new(MemoryStore::new());
        let assigner = Arc::new(RegistrationAssigner::new(
            store,
            TierSchedule::default(),
        ));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let mut handles = Vec::new();
        for _ in 0..CALLERS {
            let assigner = Arc::clone(&assigner);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                assigner.assign(Uuid::new_v4()).await.unwrap()
            }));
        }

        let mut orders = Vec::new();
        for handle in handles {
            orders.push(handle.await.unwrap().registration_order);
        }

        orders.sort_unstable();
        orders.dedup();
        assert_eq!(orders.len(), CALLERS, "orders must be pairwise distinct");
        assert_eq!(orders.first(), Some(&1));
        assert_eq!(orders.last(), Some(&(CALLERS as i64)));
    }

    #[tokio::test]
    async fn concurrent_next_order_never_repeats() {
        use tokio::sync::Barrier;

        const CALLERS: usize = 64;

        let store = Arc::new(MemoryStore::new());
        let assigner = Arc::new(RegistrationAssigner::new(
            store,
            TierSchedule::default(),
        ));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let mut handles = Vec::new();
        for _ in 0..CALLERS {
            let assigner = Arc::clone(&assigner);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                assigner.next_order().await.unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()), "duplicate order issued");
        }
    }
}
