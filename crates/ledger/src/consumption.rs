//! Priority consumption engine.
//!
//! Satisfies usage requests by draining buckets strictly in
//! trial → coupon → plan → purchased order, escalating any remainder to
//! metered overage instead of failing the request. The ordering is fixed
//! policy: trial and promotional credit are time- or goodwill-limited, plan
//! credit is replenished each period, purchased credit was paid for
//! explicitly and is preserved longest.
//!
//! Commit protocol: plan the debit split from a snapshot, run the bounded
//! payment-method check when overage is needed (before any debit), then
//! commit atomically. A stale snapshot surfaces as a conflict and the plan
//! is recomputed; the only failure a caller ever sees is
//! `OverageUnavailable`.

use std::sync::Arc;

use time::OffsetDateTime;

use vesti_shared::ShopDomain;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{BucketKind, BucketSet, DebitBreakdown, OverageCharge, UsageEvent};
use crate::overage::{OverageBiller, OverageRates};
use crate::store::{ApplyOutcome, LedgerStore};
use crate::trial::TrialLifecycleManager;

/// Commit attempts before giving up on a contended account. Each retry
/// replans from a fresh snapshot.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Overage portion of a consumption result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OverageSummary {
    pub units: i64,
    pub amount_cents: i64,
}

/// Outcome of a consumption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionResult {
    pub breakdown: DebitBreakdown,
    pub overage: Option<OverageSummary>,
    /// True when the idempotency key had been applied before; the recorded
    /// breakdown is returned and nothing was debited or billed again.
    pub replayed: bool,
}

/// Split a requested quantity across buckets in priority order, debiting
/// each only up to its balance; whatever remains after all four is the
/// overage remainder.
#[must_use]
pub fn plan_debits(buckets: &BucketSet, quantity: i64) -> DebitBreakdown {
    let mut breakdown = DebitBreakdown::default();
    let mut remaining = quantity;

    for kind in BucketKind::PRIORITY {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(buckets.get(kind).balance);
        if take > 0 {
            breakdown.set(kind, take);
            remaining -= take;
        }
    }

    breakdown.overage_units = remaining;
    breakdown
}

/// The consumption entry point for every credit-spending action.
#[derive(Clone)]
pub struct ConsumptionEngine {
    store: Arc<dyn LedgerStore>,
    biller: OverageBiller,
    trial: TrialLifecycleManager,
}

impl ConsumptionEngine {
    pub fn new(store: Arc<dyn LedgerStore>, biller: OverageBiller) -> Self {
        let trial = TrialLifecycleManager::new(store.clone());
        Self {
            store,
            biller,
            trial,
        }
    }

    /// Consume `quantity` credits for one usage event.
    ///
    /// Never fails for lack of balance - overage billing makes every request
    /// satisfiable. The only error callers see is `OverageUnavailable` (or
    /// input validation), and in that case no bucket was debited.
    pub async fn consume(
        &self,
        shop: &ShopDomain,
        quantity: i64,
        idempotency_key: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<ConsumptionResult> {
        if quantity <= 0 {
            return Err(LedgerError::InvalidAdjustment {
                reason: format!("quantity must be positive, got {quantity}"),
            });
        }
        if idempotency_key.is_empty() {
            return Err(LedgerError::InvalidAdjustment {
                reason: "idempotency key must not be empty".to_string(),
            });
        }

        // Trial expiry is evaluated lazily on access. This flips the flag
        // only; remaining trial balance stays spendable below.
        self.trial.reconcile(shop, now).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let ledger = self
                .store
                .get_ledger(shop)
                .await?
                .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;

            let breakdown = plan_debits(&ledger.buckets, quantity);
            let rates = OverageRates::for_tier(ledger.plan);

            let charge = if breakdown.overage_units > 0 {
                // Payment check comes first: a refusal here must leave every
                // bucket untouched.
                self.biller.ensure_billable(shop).await?;
                Some(self.biller.draft_charge(
                    shop,
                    breakdown.overage_units,
                    rates,
                    idempotency_key,
                    now,
                ))
            } else {
                None
            };

            let event = UsageEvent {
                shop: shop.clone(),
                idempotency_key: idempotency_key.to_string(),
                quantity,
                breakdown,
                created_at: now,
            };

            match self.store.apply_consumption(&event, charge.as_ref()).await {
                Ok(ApplyOutcome::Applied { ledger }) => {
                    tracing::info!(
                        shop = %shop,
                        quantity = quantity,
                        trial_used = breakdown.trial,
                        coupon_used = breakdown.coupon,
                        plan_used = breakdown.plan,
                        purchased_used = breakdown.purchased,
                        overage_units = breakdown.overage_units,
                        remaining_total = ledger.buckets.total(),
                        "Consumption committed"
                    );

                    let overage = match charge {
                        Some(charge) => {
                            let summary = OverageSummary {
                                units: charge.units,
                                amount_cents: charge.amount_cents,
                            };
                            self.post_committed_charge(&charge, now).await;
                            Some(summary)
                        }
                        None => None,
                    };

                    return Ok(ConsumptionResult {
                        breakdown,
                        overage,
                        replayed: false,
                    });
                }
                Ok(ApplyOutcome::Replayed { event: stored }) => {
                    tracing::info!(
                        shop = %shop,
                        idempotency_key = idempotency_key,
                        "Replayed usage event; returning recorded breakdown"
                    );
                    let overage = (stored.breakdown.overage_units > 0).then(|| OverageSummary {
                        units: stored.breakdown.overage_units,
                        amount_cents: rates.charge_cents(stored.breakdown.overage_units),
                    });
                    return Ok(ConsumptionResult {
                        breakdown: stored.breakdown,
                        overage,
                        replayed: true,
                    });
                }
                Err(e) if e.is_retryable() && attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(
                        shop = %shop,
                        attempt = attempt,
                        error = %e,
                        "Consumption snapshot went stale; replanning"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Post a committed overage charge to the platform. Failures are logged
    /// and left for the worker: the debit already committed, so the charge
    /// record stays `pending` rather than unwinding the request.
    async fn post_committed_charge(&self, charge: &OverageCharge, now: OffsetDateTime) {
        match self.biller.post_charge(charge).await {
            Ok(platform_charge_id) => {
                if let Err(e) = self
                    .store
                    .mark_overage_posted(charge.id, &platform_charge_id, now)
                    .await
                {
                    tracing::error!(
                        charge_id = %charge.id,
                        error = %e,
                        "Posted usage charge but failed to record it; worker will reconcile"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    shop = %charge.shop,
                    charge_id = %charge.id,
                    amount_cents = charge.amount_cents,
                    error = %e,
                    "Usage charge not posted; left pending for worker retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AdjustmentReason;
    use crate::overage::test::MockBillingGateway;
    use crate::store::MemoryLedgerStore;
    use time::Duration;
    use vesti_shared::PlanTier;

    fn shop() -> ShopDomain {
        ShopDomain::parse("consume-test.myshopify.com").unwrap()
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(19_500)
    }

    fn buckets(trial: i64, coupon: i64, plan: i64, purchased: i64) -> BucketSet {
        let mut set = BucketSet::empty(now());
        set.trial.balance = trial;
        set.coupon.balance = coupon;
        set.plan.balance = plan;
        set.purchased.balance = purchased;
        set
    }

    #[test]
    fn test_plan_debits_drains_left_to_right() {
        let breakdown = plan_debits(&buckets(3, 2, 5, 10), 7);
        assert_eq!(breakdown.trial, 3);
        assert_eq!(breakdown.coupon, 2);
        assert_eq!(breakdown.plan, 2);
        assert_eq!(breakdown.purchased, 0);
        assert_eq!(breakdown.overage_units, 0);
    }

    #[test]
    fn test_plan_debits_shortfall_goes_to_overage() {
        let breakdown = plan_debits(&buckets(0, 0, 0, 1), 5);
        assert_eq!(breakdown.purchased, 1);
        assert_eq!(breakdown.overage_units, 4);
    }

    #[test]
    fn test_plan_debits_exact_fit() {
        let breakdown = plan_debits(&buckets(1, 1, 1, 1), 4);
        assert_eq!(breakdown.bucket_total(), 4);
        assert_eq!(breakdown.overage_units, 0);
    }

    async fn engine_with(
        seed: impl FnOnce(&mut BucketSet),
        gateway: MockBillingGateway,
    ) -> (ConsumptionEngine, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .create_account(&shop(), PlanTier::Growth, now())
            .await
            .unwrap();

        // Shape the buckets: drain the seeded trial grant, then apply the
        // requested balances through the normal adjust path.
        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        let mut wanted = BucketSet::empty(now());
        seed(&mut wanted);
        for kind in BucketKind::PRIORITY {
            let current = ledger.buckets.get(kind).balance;
            let delta = wanted.get(kind).balance - current;
            if delta != 0 {
                store
                    .adjust(&shop(), kind, delta, AdjustmentReason::CreditPurchase, None, now())
                    .await
                    .unwrap();
            }
        }

        let biller = OverageBiller::new(Arc::new(gateway));
        (ConsumptionEngine::new(store.clone() as Arc<dyn LedgerStore>, biller), store)
    }

    #[tokio::test]
    async fn test_consume_without_overage() {
        let (engine, store) = engine_with(
            |b| {
                b.trial.balance = 3;
                b.coupon.balance = 2;
                b.plan.balance = 5;
                b.purchased.balance = 10;
            },
            MockBillingGateway::without_billing_method(),
        )
        .await;

        let result = engine.consume(&shop(), 7, "use_a", now()).await.unwrap();
        assert!(!result.replayed);
        assert!(result.overage.is_none());

        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        assert_eq!(ledger.buckets.trial.balance, 0);
        assert_eq!(ledger.buckets.coupon.balance, 0);
        assert_eq!(ledger.buckets.plan.balance, 3);
        assert_eq!(ledger.buckets.purchased.balance, 10);
    }

    #[tokio::test]
    async fn test_consume_escalates_shortfall_to_overage() {
        let gateway = MockBillingGateway::billable();
        let (engine, store) = engine_with(
            |b| {
                b.purchased.balance = 1;
            },
            gateway.clone(),
        )
        .await;

        let result = engine.consume(&shop(), 5, "use_b", now()).await.unwrap();
        let overage = result.overage.unwrap();
        assert_eq!(overage.units, 4);
        // Growth tier: 25 cents per unit.
        assert_eq!(overage.amount_cents, 100);

        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        assert_eq!(ledger.buckets.purchased.balance, 0);
        assert_eq!(gateway.posted_charges().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_blocked_overage_leaves_balances_untouched() {
        let (engine, store) = engine_with(
            |b| {
                b.purchased.balance = 1;
            },
            MockBillingGateway::without_billing_method(),
        )
        .await;

        let err = engine.consume(&shop(), 5, "use_c", now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::OverageUnavailable { .. }));

        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        assert_eq!(ledger.buckets.purchased.balance, 1);
        assert!(store.usage_event("use_c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_replay_does_not_double_debit() {
        let (engine, store) = engine_with(
            |b| {
                b.plan.balance = 10;
            },
            MockBillingGateway::without_billing_method(),
        )
        .await;

        let first = engine.consume(&shop(), 4, "use_d", now()).await.unwrap();
        let replay = engine.consume(&shop(), 4, "use_d", now()).await.unwrap();

        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(first.breakdown, replay.breakdown);

        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        assert_eq!(ledger.buckets.plan.balance, 6);
    }

    #[tokio::test]
    async fn test_consume_ended_trial_still_drains_trial_first() {
        let (engine, store) = engine_with(
            |b| {
                b.trial.balance = 12;
                b.coupon.balance = 5;
                b.plan.balance = 5;
            },
            MockBillingGateway::without_billing_method(),
        )
        .await;

        // Push the clock past the trial window; consume reconciles lazily.
        let later = now() + Duration::days(35);
        let result = engine.consume(&shop(), 5, "use_e", later).await.unwrap();

        assert_eq!(result.breakdown.trial, 5);
        assert_eq!(result.breakdown.coupon, 0);

        let ledger = store.get_ledger(&shop()).await.unwrap().unwrap();
        assert!(!ledger.trial.is_active());
        assert_eq!(ledger.buckets.trial.balance, 7);
    }

    #[tokio::test]
    async fn test_consume_rejects_bad_input() {
        let (engine, _) = engine_with(|_| {}, MockBillingGateway::billable()).await;

        assert!(matches!(
            engine.consume(&shop(), 0, "use_f", now()).await,
            Err(LedgerError::InvalidAdjustment { .. })
        ));
        assert!(matches!(
            engine.consume(&shop(), -2, "use_g", now()).await,
            Err(LedgerError::InvalidAdjustment { .. })
        ));
        assert!(matches!(
            engine.consume(&shop(), 1, "", now()).await,
            Err(LedgerError::InvalidAdjustment { .. })
        ));
    }
}
