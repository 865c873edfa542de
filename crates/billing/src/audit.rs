//! Consistency audit and repair
//!
//! The processor is the source of truth; missed or permanently-failed
//! webhook deliveries leave the local record behind. The auditor
//! re-fetches authoritative state, compares the reconciler-owned fields,
//! and can force the local record back into agreement by replaying the
//! generic sync path with the fresh snapshot.

use std::sync::Arc;

use serde::Serialize;

use crate::client::ProcessorClient;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionState;
use crate::subscription::{BillingStore, Subscription};
use crate::webhooks;

/// One field that disagrees between the local record and the processor.
#[derive(Debug, Clone, Serialize)]
pub struct FieldDrift {
    pub field: &'static str,
    pub local: String,
    pub processor: String,
}

/// Counters from a full audit sweep.
#[derive(Debug, Default, Serialize)]
pub struct SweepOutcome {
    pub audited: usize,
    pub drifted: usize,
    pub repaired: usize,
    pub errors: usize,
}

pub struct ConsistencyAuditor {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn ProcessorClient>,
}

impl ConsistencyAuditor {
    pub fn new(store: Arc<dyn BillingStore>, processor: Arc<dyn ProcessorClient>) -> Self {
        Self { store, processor }
    }

    /// Compare the local record against the processor's current view.
    /// Returns whether they match; the full diff is logged on mismatch.
    pub async fn audit_consistency(&self, subscription_ref: &str) -> BillingResult<bool> {
        let local = self
            .store
            .find_by_subscription_ref(subscription_ref)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_ref.to_string()))?;

        let remote = self.processor.fetch_subscription(subscription_ref).await?;
        let drift = diff_fields(&local, &remote);

        if drift.is_empty() {
            tracing::debug!(
                subscription_ref = %subscription_ref,
                "Audit passed - local record matches processor"
            );
            Ok(true)
        } else {
            tracing::warn!(
                subscription_ref = %subscription_ref,
                subscription_id = %local.id,
                drift = %serde_json::to_string(&drift).unwrap_or_default(),
                "Consistency drift detected"
            );
            Ok(false)
        }
    }

    /// Force a full re-sync from freshly fetched processor state,
    /// regardless of event history. Self-healing for drift caused by
    /// missed or permanently-failed events.
    pub async fn repair(&self, subscription_ref: &str) -> BillingResult<Subscription> {
        let remote = self.processor.fetch_subscription(subscription_ref).await?;
        let repaired = webhooks::force_sync(self.store.as_ref(), &remote).await?;

        tracing::info!(
            subscription_ref = %subscription_ref,
            subscription_id = %repaired.id,
            status = %repaired.status,
            "Repaired subscription from processor state"
        );
        Ok(repaired)
    }

    /// Audit every subscription holding a processor ref, repairing any
    /// that drifted. One subscription's failure never blocks the rest.
    pub async fn run_sweep(&self, limit: i64) -> BillingResult<SweepOutcome> {
        let subscriptions = self.store.list_with_processor_refs(limit).await?;
        let mut outcome = SweepOutcome::default();

        for sub in subscriptions {
            let Some(subscription_ref) = sub.processor_subscription_ref.as_deref() else {
                continue;
            };
            outcome.audited += 1;

            match self.audit_consistency(subscription_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    outcome.drifted += 1;
                    match self.repair(subscription_ref).await {
                        Ok(_) => outcome.repaired += 1,
                        Err(e) => {
                            outcome.errors += 1;
                            tracing::error!(
                                subscription_ref = %subscription_ref,
                                error = %e,
                                "Failed to repair drifted subscription"
                            );
                        }
                    }
                }
                Err(e) => {
                    outcome.errors += 1;
                    tracing::error!(
                        subscription_ref = %subscription_ref,
                        error = %e,
                        "Audit failed"
                    );
                }
            }
        }

        tracing::info!(
            audited = outcome.audited,
            drifted = outcome.drifted,
            repaired = outcome.repaired,
            errors = outcome.errors,
            "Consistency sweep complete"
        );
        Ok(outcome)
    }
}

/// Field-by-field comparison of the reconciler-owned fields. Period
/// bounds the processor snapshot does not carry are skipped — absence of
/// data is not disagreement.
fn diff_fields(local: &Subscription, remote: &SubscriptionState) -> Vec<FieldDrift> {
    let mut drift = Vec::new();

    if local.status != remote.status {
        drift.push(FieldDrift {
            field: "status",
            local: local.status.to_string(),
            processor: remote.status.to_string(),
        });
    }

    if local.cancel_at_period_end != remote.cancel_at_period_end {
        drift.push(FieldDrift {
            field: "cancel_at_period_end",
            local: local.cancel_at_period_end.to_string(),
            processor: remote.cancel_at_period_end.to_string(),
        });
    }

    if let Some(remote_start) = remote.current_period_start {
        if local.current_period_start != Some(remote_start) {
            drift.push(FieldDrift {
                field: "current_period_start",
                local: format!("{:?}", local.current_period_start),
                processor: remote_start.to_string(),
            });
        }
    }

    if let Some(remote_end) = remote.current_period_end {
        if local.current_period_end != Some(remote_end) {
            drift.push(FieldDrift {
                field: "current_period_end",
                local: format!("{:?}", local.current_period_end),
                processor: remote_end.to_string(),
            });
        }
    }

    drift
}
