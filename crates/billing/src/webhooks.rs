//! Webhook reconciliation
//!
//! Validates inbound processor events, classifies them, and folds them
//! into the local subscription records. Deliveries are at-least-once and
//! unordered, so every handler recomputes the full target state from the
//! event payload and writes it with one statement — never increments,
//! never appends. Re-delivering any event lands on the same final record.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::client::ProcessorConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    classify_update, parse_event, CheckoutState, CustomerState, Event, InvoiceState,
    SubscriptionState, UpdateKind, WebhookEvent,
};
use crate::subscription::{BillingStore, EventClaim, Subscription, SubscriptionStatus};
use crate::tier::TierSchedule;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload before it is rejected as a replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify the `t=<unix>,v1=<hex>` signature header against the shared
/// endpoint secret: HMAC-SHA256 over `"{timestamp}.{payload}"`.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| {
            tracing::error!("System time error: {}", e);
            BillingError::WebhookSignatureInvalid
        })?
        .as_secs() as i64;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret may carry a "whsec_" prefix depending on how the
    // endpoint was provisioned.
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Full target state for a generic sync: re-map status, flag, and period
/// bounds from the event. Fields the event does not carry keep their
/// stored values rather than being erased.
fn generic_sync_target(mut sub: Subscription, state: &SubscriptionState) -> Subscription {
    if sub.status.is_terminal() && state.status != SubscriptionStatus::Canceled {
        tracing::warn!(
            subscription_id = %sub.id,
            incoming_status = %state.status,
            "Event moves subscription out of canceled - processor is authoritative, applying"
        );
    }

    sub.status = state.status;
    sub.cancel_at_period_end = state.cancel_at_period_end;
    sub.processor_subscription_ref = Some(state.subscription_ref.clone());
    if sub.processor_customer_ref.is_none() {
        sub.processor_customer_ref = state.customer_ref.clone();
    }
    if state.current_period_start.is_some() {
        sub.current_period_start = state.current_period_start;
    }
    if state.current_period_end.is_some() {
        sub.current_period_end = state.current_period_end;
    }
    if state.trial_end.is_some() {
        sub.trial_end = state.trial_end;
    }
    sub
}

/// Renewal: the billing cycle rolled over on an active subscription.
/// Any previously scheduled cancellation is void.
fn renewal_target(mut sub: Subscription, state: &SubscriptionState) -> Subscription {
    sub.status = SubscriptionStatus::Active;
    sub.cancel_at_period_end = false;
    sub.current_period_start = state.current_period_start;
    sub.current_period_end = state.current_period_end;
    sub
}

/// Cancellation handling, shared by updated and deleted events. A
/// scheduled cancellation (flag set, processor still reports active)
/// keeps the subscription active until the period actually ends.
fn cancellation_target(mut sub: Subscription, state: &SubscriptionState) -> Subscription {
    if state.cancel_at_period_end && state.status == SubscriptionStatus::Active {
        sub.status = SubscriptionStatus::Active;
        sub.cancel_at_period_end = true;
    } else {
        sub.status = SubscriptionStatus::Canceled;
        sub.cancel_at_period_end = state.cancel_at_period_end;
    }
    if state.current_period_end.is_some() {
        sub.current_period_end = state.current_period_end;
    }
    sub
}

/// Webhook handler: validation plus event dispatch.
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    config: ProcessorConfig,
    schedule: TierSchedule,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        config: ProcessorConfig,
        schedule: TierSchedule,
    ) -> Self {
        Self {
            store,
            config,
            schedule,
        }
    }

    /// Verify authenticity and parse the payload into the typed union.
    /// Nothing is mutated before this passes.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        verify_signature(payload, signature, &self.config.webhook_secret)?;
        parse_event(payload)
    }

    /// Process a verified event.
    ///
    /// Claims the event in the ledger first so a concurrent duplicate
    /// delivery is skipped; records the outcome after processing.
    /// Duplicate deliveries return Ok — at-least-once delivery makes them
    /// routine, not errors.
    pub async fn handle_event(&self, event: &Event) -> BillingResult<()> {
        let event_type = event.kind.name().to_string();

        match self.store.claim_event(&event.id, &event_type).await? {
            EventClaim::Claimed => {}
            EventClaim::Duplicate => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Duplicate webhook event - skipping"
                );
                return Ok(());
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let result = self.process_event(event).await;

        let (outcome, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = self
            .store
            .complete_event(&event.id, outcome, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook event outcome"
            );
        }

        result
    }

    /// Dispatch on event category. Informational events log and return.
    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match &event.kind {
            WebhookEvent::SubscriptionCreated(state) => {
                self.apply_subscription_created(state).await
            }
            WebhookEvent::SubscriptionUpdated(state) => {
                self.apply_subscription_updated(state).await
            }
            WebhookEvent::SubscriptionDeleted(state) => {
                // Deletion is cancellation; same handling either way.
                self.apply_cancellation(state).await
            }
            WebhookEvent::PaymentSucceeded(invoice) => {
                self.apply_payment_outcome(invoice, SubscriptionStatus::Active)
                    .await
            }
            WebhookEvent::PaymentFailed(invoice) => {
                // A failed payment does not cancel anything; the
                // processor sends a separate deletion event if dunning
                // gives up.
                self.apply_payment_outcome(invoice, SubscriptionStatus::PastDue)
                    .await
            }
            WebhookEvent::CheckoutCompleted(session) => {
                self.note_checkout_completed(session);
                Ok(())
            }
            WebhookEvent::CustomerCreated(customer) | WebhookEvent::CustomerUpdated(customer) => {
                self.backfill_customer_ref(customer).await
            }
            WebhookEvent::TrialWillEnd(state) => {
                // Extension point for notification hooks.
                tracing::info!(
                    subscription_ref = %state.subscription_ref,
                    trial_end = ?state.trial_end,
                    "Trial ending soon"
                );
                Ok(())
            }
            WebhookEvent::InvoiceCreated(invoice) | WebhookEvent::InvoiceUpcoming(invoice) => {
                tracing::info!(
                    invoice_ref = %invoice.invoice_ref,
                    amount_due_cents = invoice.amount_due_cents,
                    "Informational invoice event"
                );
                Ok(())
            }
            WebhookEvent::Ignored { event_type } => {
                // Tracked so new processor event types surface in logs.
                tracing::info!(
                    event_type = %event_type,
                    "Received unhandled processor event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    /// First sight of a processor subscription: resolve by the account
    /// reference stamped into checkout metadata (the subscription ref is
    /// not known locally yet), persist refs, and start the trial if the
    /// record was still incomplete.
    async fn apply_subscription_created(&self, state: &SubscriptionState) -> BillingResult<()> {
        let Some(user_id) = state.account_ref else {
            tracing::warn!(
                subscription_ref = %state.subscription_ref,
                "Subscription created event carries no account reference - skipping"
            );
            return Ok(());
        };

        let Some(sub) = self.store.find_by_user(user_id).await? else {
            tracing::info!(
                user_id = %user_id,
                subscription_ref = %state.subscription_ref,
                "Subscription created event for unknown account - skipping"
            );
            return Ok(());
        };

        let was_incomplete = sub.status == SubscriptionStatus::Incomplete;
        let tier = sub.tier;
        let mut target = generic_sync_target(sub, state);

        if was_incomplete {
            target.status = SubscriptionStatus::Trialing;
            target.trial_end = state.trial_end.or_else(|| {
                let days = self.schedule.trial_days_for(tier);
                Some(OffsetDateTime::now_utc() + Duration::days(days))
            });
        }

        self.store.update_billing_state(&target).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %target.id,
            subscription_ref = %state.subscription_ref,
            status = %target.status,
            "Subscription created"
        );
        Ok(())
    }

    /// Renewal vs. cancellation vs. generic sync, per classification.
    async fn apply_subscription_updated(&self, state: &SubscriptionState) -> BillingResult<()> {
        let Some(sub) = self.resolve_by_ref(&state.subscription_ref).await? else {
            return Ok(());
        };

        let kind = classify_update(state, &sub);
        let target = match kind {
            UpdateKind::Renewal => renewal_target(sub, state),
            UpdateKind::Cancellation => cancellation_target(sub, state),
            UpdateKind::GenericSync => generic_sync_target(sub, state),
        };

        self.store.update_billing_state(&target).await?;

        if target.status == SubscriptionStatus::PastDue {
            tracing::warn!(
                subscription_id = %target.id,
                subscription_ref = %state.subscription_ref,
                "Subscription is past due"
            );
        }

        tracing::info!(
            subscription_id = %target.id,
            subscription_ref = %state.subscription_ref,
            classification = ?kind,
            status = %target.status,
            "Subscription updated"
        );
        Ok(())
    }

    async fn apply_cancellation(&self, state: &SubscriptionState) -> BillingResult<()> {
        let Some(sub) = self.resolve_by_ref(&state.subscription_ref).await? else {
            return Ok(());
        };

        let target = cancellation_target(sub, state);
        self.store.update_billing_state(&target).await?;

        tracing::info!(
            subscription_id = %target.id,
            subscription_ref = %state.subscription_ref,
            status = %target.status,
            cancel_at_period_end = target.cancel_at_period_end,
            "Subscription cancellation applied"
        );
        Ok(())
    }

    /// Shared by payment succeeded/failed: resolve through the invoice's
    /// linked subscription, set the outcome status, refresh period bounds
    /// from the invoice's period.
    async fn apply_payment_outcome(
        &self,
        invoice: &InvoiceState,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        let Some(subscription_ref) = invoice.subscription_ref.as_deref() else {
            // One-off invoice with no subscription attached.
            tracing::debug!(
                invoice_ref = %invoice.invoice_ref,
                "Invoice event without subscription ref - skipping"
            );
            return Ok(());
        };

        let Some(mut sub) = self.resolve_by_ref(subscription_ref).await? else {
            return Ok(());
        };

        sub.status = status;
        if invoice.period_start.is_some() {
            sub.current_period_start = invoice.period_start;
        }
        if invoice.period_end.is_some() {
            sub.current_period_end = invoice.period_end;
        }

        self.store.update_billing_state(&sub).await?;

        tracing::info!(
            subscription_id = %sub.id,
            subscription_ref = %subscription_ref,
            invoice_ref = %invoice.invoice_ref,
            status = %status,
            "Payment outcome applied"
        );
        Ok(())
    }

    /// Subscription-mode checkouts are informational: the subsequent
    /// subscription.created event carries the real state change.
    fn note_checkout_completed(&self, session: &CheckoutState) {
        if session.mode == "subscription" {
            tracing::info!(
                session_ref = %session.session_ref,
                subscription_ref = ?session.subscription_ref,
                account_ref = ?session.account_ref,
                "Subscription checkout completed"
            );
        } else {
            tracing::debug!(
                session_ref = %session.session_ref,
                mode = %session.mode,
                "Non-subscription checkout completed - out of scope"
            );
        }
    }

    /// Opportunistically backfill the customer ref; an existing ref is
    /// never overwritten.
    async fn backfill_customer_ref(&self, customer: &CustomerState) -> BillingResult<()> {
        let Some(user_id) = customer.account_ref else {
            tracing::debug!(
                customer_ref = %customer.customer_ref,
                "Customer event carries no account reference - skipping"
            );
            return Ok(());
        };

        let Some(mut sub) = self.store.find_by_user(user_id).await? else {
            tracing::info!(
                user_id = %user_id,
                customer_ref = %customer.customer_ref,
                "Customer event for unknown account - skipping"
            );
            return Ok(());
        };

        if sub.processor_customer_ref.is_some() {
            return Ok(());
        }

        sub.processor_customer_ref = Some(customer.customer_ref.clone());
        self.store.update_billing_state(&sub).await?;

        tracing::info!(
            subscription_id = %sub.id,
            customer_ref = %customer.customer_ref,
            "Backfilled processor customer ref"
        );
        Ok(())
    }

    /// Events referencing subscriptions this system has no record of are
    /// logged no-ops: retrying cannot resolve a missing mapping.
    async fn resolve_by_ref(&self, subscription_ref: &str) -> BillingResult<Option<Subscription>> {
        let sub = self.store.find_by_subscription_ref(subscription_ref).await?;
        if sub.is_none() {
            tracing::info!(
                subscription_ref = %subscription_ref,
                "Event references unknown subscription - skipping"
            );
        }
        Ok(sub)
    }
}

/// Force the local record for `state.subscription_ref` to the given
/// authoritative snapshot by replaying the generic sync path. Used by the
/// consistency auditor's repair, which bypasses event history entirely.
pub(crate) async fn force_sync(
    store: &dyn BillingStore,
    state: &SubscriptionState,
) -> BillingResult<Subscription> {
    let sub = store
        .find_by_subscription_ref(&state.subscription_ref)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(state.subscription_ref.clone()))?;

    let target = generic_sync_target(sub, state);
    store.update_billing_state(&target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::subscription::{NewSubscription, SubscriptionStore};
    use crate::tier::Tier;
    use uuid::Uuid;

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            secret_key: "sk_test".into(),
            webhook_secret: "whsec_testsecret".into(),
            api_base: "http://localhost".into(),
        }
    }

    fn sign(payload: &str, secret: &str) -> String {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    async fn seeded_handler() -> (Arc<MemoryStore>, WebhookHandler, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        store
            .create(NewSubscription {
                user_id,
                registration_order: 150,
                tier: Tier::Promotional,
                status: SubscriptionStatus::Incomplete,
            })
            .await
            .unwrap();
        let handler = WebhookHandler::new(store.clone(), config(), TierSchedule::default());
        (store, handler, user_id)
    }

    fn created_event(user_id: Uuid, event_id: &str) -> Event {
        let payload = format!(
            r#"{{
                "id": "{}",
                "type": "customer.subscription.created",
                "created": 1700000000,
                "data": {{"object": {{
                    "id": "sub_42",
                    "customer": "cus_42",
                    "status": "trialing",
                    "cancel_at_period_end": false,
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000,
                    "trial_end": 1707776000,
                    "metadata": {{"user_id": "{}"}}
                }}}}
            }}"#,
            event_id, user_id
        );
        parse_event(&payload).unwrap()
    }

    fn updated_event(event_id: &str, status: &str, period_start: i64, cancel: bool) -> Event {
        let payload = format!(
            r#"{{
                "id": "{}",
                "type": "customer.subscription.updated",
                "created": 1700000000,
                "data": {{"object": {{
                    "id": "sub_42",
                    "customer": "cus_42",
                    "status": "{}",
                    "cancel_at_period_end": {},
                    "current_period_start": {},
                    "current_period_end": {}
                }}}}
            }}"#,
            event_id,
            status,
            cancel,
            period_start,
            period_start + 2_592_000
        );
        parse_event(&payload).unwrap()
    }

    fn invoice_event(event_id: &str, event_type: &str, subscription_ref: &str) -> Event {
        let payload = format!(
            r#"{{
                "id": "{}",
                "type": "{}",
                "created": 1700000000,
                "data": {{"object": {{
                    "id": "in_7",
                    "subscription": "{}",
                    "period_start": 1705000000,
                    "period_end": 1707592000,
                    "amount_due": 900
                }}}}
            }}"#,
            event_id, event_type, subscription_ref
        );
        parse_event(&payload).unwrap()
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let signature = sign(payload, "whsec_testsecret");
        assert!(verify_signature(payload, &signature, "whsec_testsecret").is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let signature = sign(payload, "whsec_other");
        let err = verify_signature(payload, &signature, "whsec_testsecret").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn rejects_tampered_payload() {
        let signature = sign(r#"{"id":"evt_1"}"#, "whsec_testsecret");
        let err =
            verify_signature(r#"{"id":"evt_2"}"#, &signature, "whsec_testsecret").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            - 3600;
        let mut mac = HmacSha256::new_from_slice(b"testsecret").unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let signature = format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        );
        let err = verify_signature(payload, &signature, "whsec_testsecret").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn rejects_malformed_signature_header() {
        let err = verify_signature("{}", "v1=deadbeef", "whsec_testsecret").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn created_event_starts_trial_and_persists_refs() {
        let (store, handler, user_id) = seeded_handler().await;

        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();

        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.processor_subscription_ref.as_deref(), Some("sub_42"));
        assert_eq!(sub.processor_customer_ref.as_deref(), Some("cus_42"));
        assert!(sub.trial_end.is_some());
        assert!(sub.current_period_start.is_some());
        assert_eq!(
            store
                .ledger_entry("evt_1")
                .await
                .map(|(_, outcome, _)| outcome),
            Some("success".to_string())
        );
    }

    #[tokio::test]
    async fn redelivered_event_is_idempotent() {
        let (store, handler, user_id) = seeded_handler().await;

        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();
        let first = store.find_by_user(user_id).await.unwrap().unwrap();

        // Same event id: ledger skip.
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();
        // Same payload under a fresh id: full reprocessing, same state.
        handler
            .handle_event(&created_event(user_id, "evt_1_redelivery"))
            .await
            .unwrap();

        let second = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(second.status, first.status);
        assert_eq!(second.trial_end, first.trial_end);
        assert_eq!(second.current_period_start, first.current_period_start);
        assert_eq!(second.current_period_end, first.current_period_end);
        assert_eq!(second.cancel_at_period_end, first.cancel_at_period_end);
    }

    #[tokio::test]
    async fn renewal_resets_scheduled_cancellation() {
        let (store, handler, user_id) = seeded_handler().await;
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();

        // Schedule a cancellation first.
        handler
            .handle_event(&updated_event("evt_2", "active", 1_700_000_000, true))
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.status, SubscriptionStatus::Active);

        // Period start moves forward with status active: renewal.
        handler
            .handle_event(&updated_event("evt_3", "active", 1_702_592_000, false))
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(
            sub.current_period_start,
            OffsetDateTime::from_unix_timestamp(1_702_592_000).ok()
        );
    }

    #[tokio::test]
    async fn scheduled_cancellation_keeps_subscription_active() {
        let (store, handler, user_id) = seeded_handler().await;
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();

        handler
            .handle_event(&updated_event("evt_2", "active", 1_700_000_000, true))
            .await
            .unwrap();

        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancel_at_period_end);
        assert!(sub.current_period_end.is_some());
    }

    #[tokio::test]
    async fn deleted_event_cancels() {
        let (store, handler, user_id) = seeded_handler().await;
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();

        let payload = r#"{
            "id": "evt_2",
            "type": "customer.subscription.deleted",
            "created": 1700000000,
            "data": {"object": {
                "id": "sub_42",
                "status": "canceled",
                "cancel_at_period_end": false,
                "current_period_end": 1702592000
            }}
        }"#;
        handler
            .handle_event(&parse_event(payload).unwrap())
            .await
            .unwrap();

        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn payment_failed_then_succeeded_round_trip() {
        let (store, handler, user_id) = seeded_handler().await;
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();

        handler
            .handle_event(&invoice_event("evt_2", "invoice.payment_failed", "sub_42"))
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        handler
            .handle_event(&invoice_event(
                "evt_3",
                "invoice.payment_succeeded",
                "sub_42",
            ))
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(
            sub.current_period_start,
            OffsetDateTime::from_unix_timestamp(1_705_000_000).ok()
        );
        assert_eq!(
            sub.current_period_end,
            OffsetDateTime::from_unix_timestamp(1_707_592_000).ok()
        );
    }

    #[tokio::test]
    async fn unknown_subscription_ref_is_logged_no_op() {
        let (store, handler, _user_id) = seeded_handler().await;

        handler
            .handle_event(&invoice_event(
                "evt_9",
                "invoice.payment_failed",
                "sub_missing",
            ))
            .await
            .unwrap();

        assert_eq!(
            store
                .ledger_entry("evt_9")
                .await
                .map(|(_, outcome, _)| outcome),
            Some("success".to_string())
        );
    }

    #[tokio::test]
    async fn customer_event_backfills_but_never_overwrites() {
        let (store, handler, user_id) = seeded_handler().await;

        let payload = format!(
            r#"{{
                "id": "evt_2",
                "type": "customer.created",
                "data": {{"object": {{
                    "id": "cus_backfill",
                    "metadata": {{"user_id": "{}"}}
                }}}}
            }}"#,
            user_id
        );
        handler
            .handle_event(&parse_event(&payload).unwrap())
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.processor_customer_ref.as_deref(), Some("cus_backfill"));

        // A later customer event must not replace the stored ref.
        let payload = format!(
            r#"{{
                "id": "evt_3",
                "type": "customer.updated",
                "data": {{"object": {{
                    "id": "cus_other",
                    "metadata": {{"user_id": "{}"}}
                }}}}
            }}"#,
            user_id
        );
        handler
            .handle_event(&parse_event(&payload).unwrap())
            .await
            .unwrap();
        let sub = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(sub.processor_customer_ref.as_deref(), Some("cus_backfill"));
    }

    #[tokio::test]
    async fn informational_events_do_not_mutate_state() {
        let (store, handler, user_id) = seeded_handler().await;
        handler
            .handle_event(&created_event(user_id, "evt_1"))
            .await
            .unwrap();
        let before = store.find_by_user(user_id).await.unwrap().unwrap();

        let trial_payload = r#"{
            "id": "evt_2",
            "type": "customer.subscription.trial_will_end",
            "data": {"object": {
                "id": "sub_42",
                "status": "trialing",
                "trial_end": 1707776000
            }}
        }"#;
        handler
            .handle_event(&parse_event(trial_payload).unwrap())
            .await
            .unwrap();

        for (id, event_type) in [("evt_3", "invoice.upcoming"), ("evt_4", "invoice.created")] {
            let payload = format!(
                r#"{{
                    "id": "{}",
                    "type": "{}",
                    "data": {{"object": {{"id": "obj_1", "subscription": "sub_42"}}}}
                }}"#,
                id, event_type
            );
            handler
                .handle_event(&parse_event(&payload).unwrap())
                .await
                .unwrap();
        }

        let after = store.find_by_user(user_id).await.unwrap().unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.current_period_end, before.current_period_end);
    }
}
