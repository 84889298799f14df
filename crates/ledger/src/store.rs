//! Storage for account ledgers.
//!
//! [`LedgerStore`] is the persistence seam: every other component reads and
//! writes bucket state through it. Two implementations exist: the
//! Postgres-backed [`crate::pg_store::PgLedgerStore`] used in production, and
//! the in-memory [`MemoryLedgerStore`] here, used by the test suite and by
//! self-hosted dev mode.
//!
//! Every mutating operation is atomic with respect to concurrent mutations on
//! the same account, and records an audit entry tagged with its reason.
//! Idempotency keys are checked inside the same atomic scope, so webhook
//! retries and double-submits degrade to no-ops instead of double-credits.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use vesti_shared::{PlanTier, ShopDomain, TRIAL_ALLOTMENT};

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    AccountLedger, AdjustmentReason, BillingPeriod, BucketKind, BucketSet, LedgerAdjustment,
    OverageCharge, TrialState, UsageEvent,
};

/// Result of a single-bucket adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The adjustment was applied; `new_balance` is the bucket balance after.
    Applied { new_balance: i64 },
    /// The idempotency key was seen before; nothing changed.
    Duplicate,
}

/// Result of committing a consumption event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Debits committed; the returned ledger is the post-commit snapshot.
    Applied { ledger: AccountLedger },
    /// The usage key was seen before; the stored event is returned unchanged.
    Replayed { event: UsageEvent },
}

/// Result of applying a period renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Credits added; `plan_balance` is the plan bucket balance after.
    Applied { plan_balance: i64 },
    /// This period id was already applied to this account.
    Duplicate,
}

/// Persistent per-account storage of the four credit buckets plus trial
/// metadata and applied idempotency keys.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account ledger at first install/subscription: all buckets
    /// zero except trial (set to the trial allotment), trial active.
    /// Idempotent; an existing ledger is returned unchanged.
    async fn create_account(
        &self,
        shop: &ShopDomain,
        plan: PlanTier,
        now: OffsetDateTime,
    ) -> LedgerResult<AccountLedger>;

    /// Read-only snapshot of an account ledger.
    async fn get_ledger(&self, shop: &ShopDomain) -> LedgerResult<Option<AccountLedger>>;

    /// Atomically adjust one bucket by `delta`, recording an audit entry.
    ///
    /// Fails with `InsufficientBalance` if a negative delta would drive the
    /// balance below zero. When `idempotency_key` is supplied and was applied
    /// before, returns [`AdjustOutcome::Duplicate`] without touching state.
    async fn adjust(
        &self,
        shop: &ShopDomain,
        bucket: BucketKind,
        delta: i64,
        reason: AdjustmentReason,
        idempotency_key: Option<&str>,
        now: OffsetDateTime,
    ) -> LedgerResult<AdjustOutcome>;

    /// Atomically commit a consumption event: debit every bucket named in the
    /// breakdown, record the usage event, and (when present) the overage
    /// charge - all or nothing.
    ///
    /// Balances are re-checked under the account lock; a stale snapshot
    /// surfaces as `InsufficientBalance` so the engine can recompute. A
    /// replayed usage key returns the stored event without debiting.
    async fn apply_consumption(
        &self,
        event: &UsageEvent,
        overage: Option<&OverageCharge>,
    ) -> LedgerResult<ApplyOutcome>;

    /// Atomically add the period's included credits to the plan bucket,
    /// idempotent on the period id. Renewals only ever add.
    async fn apply_renewal(
        &self,
        shop: &ShopDomain,
        period: &BillingPeriod,
        now: OffsetDateTime,
    ) -> LedgerResult<RenewalOutcome>;

    /// Persist a trial state transition. Bucket balances are not touched.
    async fn set_trial_state(
        &self,
        shop: &ShopDomain,
        state: TrialState,
        now: OffsetDateTime,
    ) -> LedgerResult<()>;

    /// Look up a recorded usage event by idempotency key.
    async fn usage_event(&self, usage_key: &str) -> LedgerResult<Option<UsageEvent>>;

    /// Mark an overage charge as posted to the platform.
    async fn mark_overage_posted(
        &self,
        charge_id: Uuid,
        platform_charge_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()>;

    /// Overage charges whose usage charge has not reached the platform yet.
    async fn pending_overage_charges(&self, limit: i64) -> LedgerResult<Vec<OverageCharge>>;

    /// Most recent audit entries for an account, newest first.
    async fn recent_adjustments(
        &self,
        shop: &ShopDomain,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerAdjustment>>;

    /// Drop applied idempotency keys (and their usage events) older than the
    /// cutoff. Replays are expected to arrive within a short window of the
    /// original, so bounded retention is safe.
    async fn purge_applied_keys(&self, older_than: OffsetDateTime) -> LedgerResult<u64>;

    /// Accounts whose trial is still flagged active but whose 30-day window
    /// has elapsed at `now`. Used by the worker sweep; the engine also
    /// evaluates expiry lazily on access.
    async fn expired_trials(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<ShopDomain>>;
}

/// In-memory ledger store.
///
/// Mutations take a single writer lock, which is a stronger serialization
/// than the per-account scope the contract requires. Wraps data in `Arc` for
/// cheap cloning.
#[derive(Default, Clone)]
pub struct MemoryLedgerStore {
    inner: std::sync::Arc<std::sync::RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    ledgers: std::collections::HashMap<ShopDomain, AccountLedger>,
    applied_keys: std::collections::HashMap<String, OffsetDateTime>,
    usage_events: std::collections::HashMap<String, UsageEvent>,
    overage_charges: Vec<OverageCharge>,
    adjustments: Vec<LedgerAdjustment>,
}

impl MemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> LedgerResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.inner
            .read()
            .map_err(|_| LedgerError::Database("ledger state lock poisoned".to_string()))
    }

    fn write(&self) -> LedgerResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.inner
            .write()
            .map_err(|_| LedgerError::Database("ledger state lock poisoned".to_string()))
    }
}

impl MemoryState {
    fn ledger_mut(&mut self, shop: &ShopDomain) -> LedgerResult<&mut AccountLedger> {
        self.ledgers
            .get_mut(shop)
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })
    }

    fn record_adjustment(
        &mut self,
        shop: &ShopDomain,
        bucket: BucketKind,
        delta: i64,
        balance_after: i64,
        reason: AdjustmentReason,
        idempotency_key: Option<&str>,
        now: OffsetDateTime,
    ) {
        self.adjustments.push(LedgerAdjustment {
            id: Uuid::new_v4(),
            shop: shop.clone(),
            bucket,
            delta,
            balance_after,
            reason,
            idempotency_key: idempotency_key.map(str::to_string),
            created_at: now,
        });
    }
}

/// Apply a delta to one bucket in a set, enforcing the non-negative balance
/// invariant. Shared by both store backends' bookkeeping.
fn apply_delta(
    buckets: &mut BucketSet,
    bucket: BucketKind,
    delta: i64,
    now: OffsetDateTime,
) -> LedgerResult<i64> {
    let entry = buckets.get_mut(bucket);
    let next = entry.balance.saturating_add(delta);
    if next < 0 {
        return Err(LedgerError::InsufficientBalance {
            bucket,
            requested: delta.saturating_abs(),
            available: entry.balance,
        });
    }
    entry.balance = next;
    if delta > 0 {
        entry.lifetime_added = entry.lifetime_added.saturating_add(delta);
    }
    entry.updated_at = now;
    Ok(next)
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(
        &self,
        shop: &ShopDomain,
        plan: PlanTier,
        now: OffsetDateTime,
    ) -> LedgerResult<AccountLedger> {
        let mut state = self.write()?;

        if let Some(existing) = state.ledgers.get(shop) {
            return Ok(existing.clone());
        }

        let mut buckets = BucketSet::empty(now);
        buckets.trial.balance = TRIAL_ALLOTMENT;
        buckets.trial.lifetime_added = TRIAL_ALLOTMENT;

        let ledger = AccountLedger {
            shop: shop.clone(),
            plan,
            trial: TrialState::Active { started_at: now },
            buckets,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        state.ledgers.insert(shop.clone(), ledger.clone());
        state.record_adjustment(
            shop,
            BucketKind::Trial,
            TRIAL_ALLOTMENT,
            TRIAL_ALLOTMENT,
            AdjustmentReason::TrialGrant,
            None,
            now,
        );

        Ok(ledger)
    }

    async fn get_ledger(&self, shop: &ShopDomain) -> LedgerResult<Option<AccountLedger>> {
        Ok(self.read()?.ledgers.get(shop).cloned())
    }

    async fn adjust(
        &self,
        shop: &ShopDomain,
        bucket: BucketKind,
        delta: i64,
        reason: AdjustmentReason,
        idempotency_key: Option<&str>,
        now: OffsetDateTime,
    ) -> LedgerResult<AdjustOutcome> {
        if delta == 0 {
            return Err(LedgerError::InvalidAdjustment {
                reason: "delta must be non-zero".to_string(),
            });
        }

        let mut state = self.write()?;

        if let Some(key) = idempotency_key {
            if state.applied_keys.contains_key(key) {
                return Ok(AdjustOutcome::Duplicate);
            }
        }

        let ledger = state.ledger_mut(shop)?;
        let new_balance = apply_delta(&mut ledger.buckets, bucket, delta, now)?;
        ledger.version += 1;
        ledger.updated_at = now;

        state.record_adjustment(shop, bucket, delta, new_balance, reason, idempotency_key, now);
        if let Some(key) = idempotency_key {
            state.applied_keys.insert(key.to_string(), now);
        }

        Ok(AdjustOutcome::Applied { new_balance })
    }

    async fn apply_consumption(
        &self,
        event: &UsageEvent,
        overage: Option<&OverageCharge>,
    ) -> LedgerResult<ApplyOutcome> {
        let mut state = self.write()?;

        if let Some(existing) = state.usage_events.get(&event.idempotency_key) {
            return Ok(ApplyOutcome::Replayed {
                event: existing.clone(),
            });
        }

        let now = event.created_at;

        // All-or-nothing: verify every debit before applying any.
        {
            let ledger = state.ledger_mut(&event.shop)?;
            for kind in BucketKind::PRIORITY {
                let debit = event.breakdown.get(kind);
                let available = ledger.buckets.get(kind).balance;
                if debit > available {
                    return Err(LedgerError::InsufficientBalance {
                        bucket: kind,
                        requested: debit,
                        available,
                    });
                }
            }
        }

        let mut audit = Vec::new();
        let snapshot = {
            let ledger = state.ledger_mut(&event.shop)?;
            for kind in BucketKind::PRIORITY {
                let debit = event.breakdown.get(kind);
                if debit == 0 {
                    continue;
                }
                let balance_after = apply_delta(&mut ledger.buckets, kind, -debit, now)?;
                audit.push((kind, -debit, balance_after));
            }
            ledger.version += 1;
            ledger.updated_at = now;
            ledger.clone()
        };

        for (kind, delta, balance_after) in audit {
            state.record_adjustment(
                &event.shop,
                kind,
                delta,
                balance_after,
                AdjustmentReason::Consumption,
                Some(&event.idempotency_key),
                now,
            );
        }

        state
            .usage_events
            .insert(event.idempotency_key.clone(), event.clone());
        state.applied_keys.insert(event.idempotency_key.clone(), now);
        if let Some(charge) = overage {
            state.overage_charges.push(charge.clone());
        }

        Ok(ApplyOutcome::Applied { ledger: snapshot })
    }

    async fn apply_renewal(
        &self,
        shop: &ShopDomain,
        period: &BillingPeriod,
        now: OffsetDateTime,
    ) -> LedgerResult<RenewalOutcome> {
        if period.included_credits < 0 {
            return Err(LedgerError::InvalidAdjustment {
                reason: format!(
                    "included credits must be non-negative, got {}",
                    period.included_credits
                ),
            });
        }

        let key = renewal_key(shop, &period.period_id);
        let mut state = self.write()?;

        if state.applied_keys.contains_key(&key) {
            return Ok(RenewalOutcome::Duplicate);
        }

        let ledger = state.ledger_mut(shop)?;
        let plan_balance = apply_delta(
            &mut ledger.buckets,
            BucketKind::Plan,
            period.included_credits,
            now,
        )?;
        ledger.version += 1;
        ledger.updated_at = now;

        state.record_adjustment(
            shop,
            BucketKind::Plan,
            period.included_credits,
            plan_balance,
            AdjustmentReason::PeriodRenewal,
            Some(&key),
            now,
        );
        state.applied_keys.insert(key, now);

        Ok(RenewalOutcome::Applied { plan_balance })
    }

    async fn set_trial_state(
        &self,
        shop: &ShopDomain,
        state: TrialState,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let mut guard = self.write()?;
        let ledger = guard.ledger_mut(shop)?;
        ledger.trial = state;
        ledger.version += 1;
        ledger.updated_at = now;
        Ok(())
    }

    async fn usage_event(&self, usage_key: &str) -> LedgerResult<Option<UsageEvent>> {
        Ok(self.read()?.usage_events.get(usage_key).cloned())
    }

    async fn mark_overage_posted(
        &self,
        charge_id: Uuid,
        platform_charge_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let mut state = self.write()?;
        if let Some(charge) = state.overage_charges.iter_mut().find(|c| c.id == charge_id) {
            charge.status = crate::model::OverageChargeStatus::Posted;
            charge.platform_charge_id = Some(platform_charge_id.to_string());
            charge.posted_at = Some(now);
        }
        Ok(())
    }

    async fn pending_overage_charges(&self, limit: i64) -> LedgerResult<Vec<OverageCharge>> {
        Ok(self
            .read()?
            .overage_charges
            .iter()
            .filter(|c| c.status == crate::model::OverageChargeStatus::Pending)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn recent_adjustments(
        &self,
        shop: &ShopDomain,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerAdjustment>> {
        Ok(self
            .read()?
            .adjustments
            .iter()
            .rev()
            .filter(|a| &a.shop == shop)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn purge_applied_keys(&self, older_than: OffsetDateTime) -> LedgerResult<u64> {
        let mut state = self.write()?;
        let before = state.applied_keys.len() + state.usage_events.len();
        state.applied_keys.retain(|_, applied_at| *applied_at >= older_than);
        state
            .usage_events
            .retain(|_, event| event.created_at >= older_than);
        let after = state.applied_keys.len() + state.usage_events.len();
        Ok((before - after) as u64)
    }

    async fn expired_trials(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<ShopDomain>> {
        Ok(self
            .read()?
            .ledgers
            .values()
            .filter(|ledger| match ledger.trial {
                TrialState::Active { started_at } => {
                    now - started_at >= vesti_shared::TRIAL_DURATION
                }
                _ => false,
            })
            .take(limit.max(0) as usize)
            .map(|ledger| ledger.shop.clone())
            .collect())
    }
}

/// Idempotency key for a period renewal, scoped to the account.
pub(crate) fn renewal_key(shop: &ShopDomain, period_id: &str) -> String {
    format!("period:{shop}:{period_id}")
}
