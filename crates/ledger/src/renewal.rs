//! Billing-period renewal reconciliation.
//!
//! Driven by subscription-period-change notifications from the platform
//! webhook receiver. The defining property is additive carry-forward: a
//! renewal ADDS the period's included credits to the plan bucket and never
//! replaces or resets it. De-duplication on the period id makes webhook
//! retries and out-of-order redelivery safe.

use std::sync::Arc;

use time::OffsetDateTime;

use vesti_shared::{PlanTier, ShopDomain};

use crate::error::{LedgerError, LedgerResult};
use crate::model::BillingPeriod;
use crate::store::{LedgerStore, RenewalOutcome};

/// Period-change notification payload, as delivered by the webhook receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalNotification {
    pub period_id: String,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    /// Included credits reported by the platform. When absent, the plan
    /// tier's configured allotment is used.
    pub included_credits: Option<i64>,
}

/// Applies period renewals to the plan bucket.
#[derive(Clone)]
pub struct PeriodRenewalReconciler {
    store: Arc<dyn LedgerStore>,
}

impl PeriodRenewalReconciler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Handle a period-change notification. Replays of the same period id
    /// are success-no-ops.
    pub async fn on_period_renewed(
        &self,
        shop: &ShopDomain,
        notification: &RenewalNotification,
        now: OffsetDateTime,
    ) -> LedgerResult<RenewalOutcome> {
        if notification.period_id.is_empty() {
            return Err(LedgerError::InvalidAdjustment {
                reason: "period id must not be empty".to_string(),
            });
        }
        if notification.ends_at <= notification.starts_at {
            return Err(LedgerError::InvalidAdjustment {
                reason: "period end must be after period start".to_string(),
            });
        }

        let ledger = self
            .store
            .get_ledger(shop)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;

        let included_credits = resolve_included_credits(notification, ledger.plan);
        let period = BillingPeriod {
            period_id: notification.period_id.clone(),
            starts_at: notification.starts_at,
            ends_at: notification.ends_at,
            included_credits,
        };

        let outcome = self.store.apply_renewal(shop, &period, now).await?;

        match &outcome {
            RenewalOutcome::Applied { plan_balance } => {
                tracing::info!(
                    shop = %shop,
                    period_id = %period.period_id,
                    added = included_credits,
                    plan_balance = plan_balance,
                    "Period renewal applied"
                );
            }
            RenewalOutcome::Duplicate => {
                tracing::info!(
                    shop = %shop,
                    period_id = %period.period_id,
                    "Duplicate period renewal ignored"
                );
            }
        }

        Ok(outcome)
    }
}

/// Notification value wins; the tier allotment covers notifications that
/// omit it.
fn resolve_included_credits(notification: &RenewalNotification, plan: PlanTier) -> i64 {
    notification
        .included_credits
        .unwrap_or_else(|| plan.included_credits())
}
