//! Inbound processor events
//!
//! The processor dispatches on a string discriminator over a loosely
//! typed JSON body. Everything downstream of this module operates on the
//! closed [`WebhookEvent`] union instead: raw payloads are parsed and
//! validated here, at the boundary, and nowhere else.
//!
//! Delivery is at-least-once and unordered, so none of these payloads may
//! be interpreted as increments — each carries the full state the
//! processor believes the object is in.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscription::{map_processor_status, Subscription, SubscriptionStatus};

/// A verified, parsed processor event.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub created: Option<OffsetDateTime>,
    pub kind: WebhookEvent,
}

/// Closed union of event categories the reconciler understands.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    SubscriptionCreated(SubscriptionState),
    SubscriptionUpdated(SubscriptionState),
    SubscriptionDeleted(SubscriptionState),
    /// Informational; extension point for notification hooks.
    TrialWillEnd(SubscriptionState),
    PaymentSucceeded(InvoiceState),
    PaymentFailed(InvoiceState),
    /// Informational only.
    InvoiceCreated(InvoiceState),
    /// Informational only.
    InvoiceUpcoming(InvoiceState),
    CheckoutCompleted(CheckoutState),
    CustomerCreated(CustomerState),
    CustomerUpdated(CustomerState),
    /// Recognized envelope, event type we deliberately don't handle.
    Ignored { event_type: String },
}

impl WebhookEvent {
    pub fn name(&self) -> &str {
        match self {
            WebhookEvent::SubscriptionCreated(_) => "subscription.created",
            WebhookEvent::SubscriptionUpdated(_) => "subscription.updated",
            WebhookEvent::SubscriptionDeleted(_) => "subscription.deleted",
            WebhookEvent::TrialWillEnd(_) => "subscription.trial_will_end",
            WebhookEvent::PaymentSucceeded(_) => "invoice.payment_succeeded",
            WebhookEvent::PaymentFailed(_) => "invoice.payment_failed",
            WebhookEvent::InvoiceCreated(_) => "invoice.created",
            WebhookEvent::InvoiceUpcoming(_) => "invoice.upcoming",
            WebhookEvent::CheckoutCompleted(_) => "checkout.session.completed",
            WebhookEvent::CustomerCreated(_) => "customer.created",
            WebhookEvent::CustomerUpdated(_) => "customer.updated",
            WebhookEvent::Ignored { event_type } => event_type,
        }
    }
}

/// Normalized subscription snapshot carried by subscription events, and
/// by the processor API when the auditor re-fetches authoritative state.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub subscription_ref: String,
    pub customer_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    /// Owning account, from event metadata. Only present on events the
    /// checkout flow originated (it stamps the account id there).
    pub account_ref: Option<Uuid>,
}

/// Normalized invoice snapshot carried by payment events.
#[derive(Debug, Clone)]
pub struct InvoiceState {
    pub invoice_ref: String,
    pub subscription_ref: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub amount_due_cents: i64,
}

/// Checkout session completion. Subscription-mode sessions are
/// informational here — the subscription.created event carries the real
/// state change. One-time-payment sessions are out of scope.
#[derive(Debug, Clone)]
pub struct CheckoutState {
    pub session_ref: String,
    pub mode: String,
    pub subscription_ref: Option<String>,
    pub account_ref: Option<Uuid>,
}

/// Customer create/update, used only to backfill the customer ref.
#[derive(Debug, Clone)]
pub struct CustomerState {
    pub customer_ref: String,
    pub account_ref: Option<Uuid>,
}

/// Sub-case of a "subscription updated" event, decided before any state
/// is written so the disambiguation rules stay unit-testable on their
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Billing-cycle rollover on an already-active subscription.
    Renewal,
    /// Effective or scheduled cancellation.
    Cancellation,
    /// Anything else: re-map status and period bounds from the event.
    GenericSync,
}

/// Disambiguate renewal vs. cancellation vs. generic update.
///
/// A renewal is an active subscription whose period start moved strictly
/// forward relative to what we last persisted. The prior period start is
/// a comparison value only; a stale read merely degrades a renewal into a
/// generic sync, which the next audit corrects.
pub fn classify_update(state: &SubscriptionState, prior: &Subscription) -> UpdateKind {
    if state.status == SubscriptionStatus::Active {
        if let (Some(incoming), Some(stored)) =
            (state.current_period_start, prior.current_period_start)
        {
            if incoming > stored {
                return UpdateKind::Renewal;
            }
        }
    }

    if state.status == SubscriptionStatus::Canceled || state.cancel_at_period_end {
        return UpdateKind::Cancellation;
    }

    UpdateKind::GenericSync
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<i64>,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// The processor expands some references inline and sends others as bare
/// ids, depending on API version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpandableRef {
    Id(String),
    Object { id: String },
}

impl ExpandableRef {
    fn into_id(self) -> String {
        match self {
            ExpandableRef::Id(id) => id,
            ExpandableRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<ExpandableRef>,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    trial_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    subscription: Option<ExpandableRef>,
    period_start: Option<i64>,
    period_end: Option<i64>,
    #[serde(default)]
    amount_due: i64,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    mode: String,
    subscription: Option<ExpandableRef>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CustomerObject {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn unix_ts(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

fn account_ref(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata.get("user_id").and_then(|v| Uuid::parse_str(v).ok())
}

impl SubscriptionObject {
    fn into_state(self) -> SubscriptionState {
        let account = account_ref(&self.metadata);
        SubscriptionState {
            subscription_ref: self.id,
            customer_ref: self.customer.map(ExpandableRef::into_id),
            status: map_processor_status(&self.status),
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_start: self.current_period_start.and_then(unix_ts),
            current_period_end: self.current_period_end.and_then(unix_ts),
            trial_end: self.trial_end.and_then(unix_ts),
            account_ref: account,
        }
    }
}

impl InvoiceObject {
    fn into_state(self) -> InvoiceState {
        InvoiceState {
            invoice_ref: self.id,
            subscription_ref: self.subscription.map(ExpandableRef::into_id),
            period_start: self.period_start.and_then(unix_ts),
            period_end: self.period_end.and_then(unix_ts),
            amount_due_cents: self.amount_due,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::EventPayloadInvalid(format!("{}: {}", event_type, e))
    })
}

/// Parse a bare subscription object (the processor API's GET response
/// body uses the same shape as the webhook `data.object`).
pub(crate) fn parse_subscription_object(
    object: serde_json::Value,
) -> BillingResult<SubscriptionState> {
    Ok(decode::<SubscriptionObject>("subscription", object)?.into_state())
}

/// Parse a raw (already signature-verified) webhook body into the typed
/// union. Unknown event types become [`WebhookEvent::Ignored`]; a payload
/// that does not match the shape its own type promises is an error.
pub fn parse_event(payload: &str) -> BillingResult<Event> {
    let envelope: EventEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::EventPayloadInvalid(format!("envelope: {}", e)))?;

    let event_type = envelope.event_type.as_str();
    let object = envelope.data.object;

    let kind = match event_type {
        "customer.subscription.created" => WebhookEvent::SubscriptionCreated(
            decode::<SubscriptionObject>(event_type, object)?.into_state(),
        ),
        "customer.subscription.updated" => WebhookEvent::SubscriptionUpdated(
            decode::<SubscriptionObject>(event_type, object)?.into_state(),
        ),
        "customer.subscription.deleted" => WebhookEvent::SubscriptionDeleted(
            decode::<SubscriptionObject>(event_type, object)?.into_state(),
        ),
        "customer.subscription.trial_will_end" => WebhookEvent::TrialWillEnd(
            decode::<SubscriptionObject>(event_type, object)?.into_state(),
        ),
        // Some processor configurations emit invoice.paid, newer ones
        // invoice.payment_succeeded; both mean the same thing here.
        "invoice.paid" | "invoice.payment_succeeded" => WebhookEvent::PaymentSucceeded(
            decode::<InvoiceObject>(event_type, object)?.into_state(),
        ),
        "invoice.payment_failed" => WebhookEvent::PaymentFailed(
            decode::<InvoiceObject>(event_type, object)?.into_state(),
        ),
        "invoice.created" => WebhookEvent::InvoiceCreated(
            decode::<InvoiceObject>(event_type, object)?.into_state(),
        ),
        "invoice.upcoming" => WebhookEvent::InvoiceUpcoming(
            decode::<InvoiceObject>(event_type, object)?.into_state(),
        ),
        "checkout.session.completed" => {
            let session: CheckoutSessionObject = decode(event_type, object)?;
            let account = account_ref(&session.metadata);
            WebhookEvent::CheckoutCompleted(CheckoutState {
                session_ref: session.id,
                mode: session.mode,
                subscription_ref: session.subscription.map(ExpandableRef::into_id),
                account_ref: account,
            })
        }
        "customer.created" | "customer.updated" => {
            let customer: CustomerObject = decode(event_type, object)?;
            let account = account_ref(&customer.metadata);
            let state = CustomerState {
                customer_ref: customer.id,
                account_ref: account,
            };
            if event_type == "customer.created" {
                WebhookEvent::CustomerCreated(state)
            } else {
                WebhookEvent::CustomerUpdated(state)
            }
        }
        other => WebhookEvent::Ignored {
            event_type: other.to_string(),
        },
    };

    Ok(Event {
        id: envelope.id,
        created: envelope.created.and_then(unix_ts),
        kind,
    })
}
