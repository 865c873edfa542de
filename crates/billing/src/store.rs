//! Postgres store
//!
//! sqlx-backed implementation of the store traits. Every mutation is a
//! single statement; the registration counter increment and the event
//! ledger claim lean on the database for atomicity instead of in-process
//! locking.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscription::{
    CounterStore, EventClaim, EventLedgerStore, NewSubscription, RegistrationCounter,
    Subscription, SubscriptionStatus, SubscriptionStore,
};
use crate::tier::Tier;

/// Events stuck in `processing` longer than this are considered abandoned
/// (worker crash mid-event) and may be re-claimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, registration_order, tier, status,
    processor_customer_ref, processor_subscription_ref,
    current_period_start, current_period_end,
    cancel_at_period_end, trial_end, created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    registration_order: i64,
    tier: String,
    status: String,
    processor_customer_ref: Option<String>,
    processor_subscription_ref: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    trial_end: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let tier = Tier::from_str(&row.tier).ok_or_else(|| {
            BillingError::Database(format!("unknown tier '{}' on row {}", row.tier, row.id))
        })?;
        let status = SubscriptionStatus::from_str(&row.status).ok_or_else(|| {
            BillingError::Database(format!("unknown status '{}' on row {}", row.status, row.id))
        })?;

        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            registration_order: row.registration_order,
            tier,
            status,
            processor_customer_ref: row.processor_customer_ref,
            processor_subscription_ref: row.processor_subscription_ref,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            trial_end: row.trial_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed billing store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn create(&self, new: NewSubscription) -> BillingResult<Subscription> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (id, user_id, registration_order, tier, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.registration_order)
        .bind(new.tier.as_str())
        .bind(new.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE processor_subscription_ref = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update_billing_state(&self, subscription: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $2,
                processor_customer_ref = $3,
                processor_subscription_ref = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                trial_end = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.processor_customer_ref.as_deref())
        .bind(subscription.processor_subscription_ref.as_deref())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.trial_end)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound(
                subscription.id.to_string(),
            ));
        }
        Ok(())
    }

    async fn list_with_processor_refs(&self, limit: i64) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE processor_subscription_ref IS NOT NULL
            ORDER BY registration_order
            LIMIT $1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn next_order(&self) -> BillingResult<i64> {
        // Lazily create the singleton row. Two concurrent first callers
        // race on the insert; ON CONFLICT DO NOTHING lets the loser treat
        // the violation as success.
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT current_count FROM registration_counter WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        if existing.is_none() {
            sqlx::query(
                r#"
                INSERT INTO registration_counter (id, current_count, updated_at)
                VALUES (1, 0, NOW())
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        // The increment is one atomic statement evaluated by Postgres;
        // concurrent callers serialize on the row and each observe a
        // distinct result.
        let (next,): (i64,) = sqlx::query_as(
            r#"
            UPDATE registration_counter
            SET current_count = current_count + 1, updated_at = NOW()
            WHERE id = 1
            RETURNING current_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    async fn current(&self) -> BillingResult<Option<RegistrationCounter>> {
        let row: Option<(i64, OffsetDateTime)> =
            sqlx::query_as("SELECT current_count, updated_at FROM registration_counter WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(current_count, updated_at)| RegistrationCounter {
            current_count,
            updated_at,
        }))
    }
}

#[async_trait]
impl EventLedgerStore for PgStore {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<EventClaim> {
        // INSERT...ON CONFLICT...RETURNING atomically claims exclusive
        // processing rights. The conflict branch re-claims events whose
        // last attempt errored, and events stuck in 'processing' past the
        // timeout; successfully processed events stay claimed forever.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processor_webhook_events
                (id, event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE processor_webhook_events.processing_result = 'error'
               OR (processor_webhook_events.processing_result = 'processing'
                   AND processor_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            EventClaim::Claimed
        } else {
            EventClaim::Duplicate
        })
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processor_webhook_events
            SET processing_result = $2, error_message = $3
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
