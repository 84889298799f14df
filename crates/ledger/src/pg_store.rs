//! Postgres-backed ledger store.
//!
//! Per-account serialization comes from a row lock (`SELECT ... FOR UPDATE`)
//! on the account's `credit_ledgers` row: every read-modify-write sequence
//! runs inside one transaction holding that lock, so concurrent adjustments
//! on the same account serialize while other accounts proceed in parallel.
//! Idempotency claims use `INSERT ... ON CONFLICT DO NOTHING` so a replayed
//! key is detected atomically, without a separate existence check.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use vesti_shared::{PlanTier, ShopDomain, TRIAL_ALLOTMENT, TRIAL_DURATION};

use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    AccountLedger, AdjustmentReason, BillingPeriod, BucketKind, BucketSet, CreditBucket,
    LedgerAdjustment, OverageCharge, TrialState, UsageEvent,
};
use crate::store::{renewal_key, AdjustOutcome, ApplyOutcome, LedgerStore, RenewalOutcome};

/// Production ledger store over Postgres.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the ledger schema migrations.
    pub async fn run_migrations(pool: &PgPool) -> LedgerResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        tracing::info!("Ledger migrations applied");
        Ok(())
    }

    /// Lock and load the account row inside the given transaction.
    async fn lock_ledger(
        tx: &mut Transaction<'_, Postgres>,
        shop: &ShopDomain,
    ) -> LedgerResult<LedgerRow> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT shop_domain, plan_tier, trial_started_at, trial_ended_at, trial_end_reason,
                   trial_balance, trial_lifetime, coupon_balance, coupon_lifetime,
                   plan_balance, plan_lifetime, purchased_balance, purchased_lifetime,
                   version, created_at, updated_at
            FROM credit_ledgers
            WHERE shop_domain = $1
            FOR UPDATE
            "#,
        )
        .bind(shop.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })
    }

    /// Atomically claim an idempotency key. Returns false when the key was
    /// already applied.
    async fn claim_key(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        shop: &ShopDomain,
        now: OffsetDateTime,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO applied_ledger_keys (idempotency_key, shop_domain, applied_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(shop.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Write one audit entry inside the given transaction.
    async fn insert_adjustment(
        tx: &mut Transaction<'_, Postgres>,
        shop: &ShopDomain,
        bucket: BucketKind,
        delta: i64,
        balance_after: i64,
        reason: AdjustmentReason,
        idempotency_key: Option<&str>,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_adjustments
                (id, shop_domain, bucket, delta, balance_after, reason, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(shop.as_str())
        .bind(bucket.as_str())
        .bind(delta)
        .bind(balance_after)
        .bind(reason.as_str())
        .bind(idempotency_key)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Persist the full bucket set, version, and timestamp for an account.
    async fn write_buckets(
        tx: &mut Transaction<'_, Postgres>,
        shop: &ShopDomain,
        buckets: &BucketSet,
        version: i64,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE credit_ledgers SET
                trial_balance = $2, trial_lifetime = $3,
                coupon_balance = $4, coupon_lifetime = $5,
                plan_balance = $6, plan_lifetime = $7,
                purchased_balance = $8, purchased_lifetime = $9,
                version = $10, updated_at = $11
            WHERE shop_domain = $1
            "#,
        )
        .bind(shop.as_str())
        .bind(buckets.trial.balance)
        .bind(buckets.trial.lifetime_added)
        .bind(buckets.coupon.balance)
        .bind(buckets.coupon.lifetime_added)
        .bind(buckets.plan.balance)
        .bind(buckets.plan.lifetime_added)
        .bind(buckets.purchased.balance)
        .bind(buckets.purchased.lifetime_added)
        .bind(version)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(
        &self,
        shop: &ShopDomain,
        plan: PlanTier,
        now: OffsetDateTime,
    ) -> LedgerResult<AccountLedger> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO credit_ledgers
                (shop_domain, plan_tier, trial_started_at,
                 trial_balance, trial_lifetime, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4, $3, $3)
            ON CONFLICT (shop_domain) DO NOTHING
            "#,
        )
        .bind(shop.as_str())
        .bind(plan.as_str())
        .bind(now)
        .bind(TRIAL_ALLOTMENT)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() > 0 {
            Self::insert_adjustment(
                &mut tx,
                shop,
                BucketKind::Trial,
                TRIAL_ALLOTMENT,
                TRIAL_ALLOTMENT,
                AdjustmentReason::TrialGrant,
                None,
                now,
            )
            .await?;
            tracing::info!(shop = %shop, plan = %plan, "Created account ledger");
        }

        let row = Self::lock_ledger(&mut tx, shop).await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn get_ledger(&self, shop: &ShopDomain) -> LedgerResult<Option<AccountLedger>> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT shop_domain, plan_tier, trial_started_at, trial_ended_at, trial_end_reason,
                   trial_balance, trial_lifetime, coupon_balance, coupon_lifetime,
                   plan_balance, plan_lifetime, purchased_balance, purchased_lifetime,
                   version, created_at, updated_at
            FROM credit_ledgers
            WHERE shop_domain = $1
            "#,
        )
        .bind(shop.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
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

        let mut tx = self.pool.begin().await?;

        if let Some(key) = idempotency_key {
            if !Self::claim_key(&mut tx, key, shop, now).await? {
                return Ok(AdjustOutcome::Duplicate);
            }
        }

        let row = Self::lock_ledger(&mut tx, shop).await?;
        let mut ledger: AccountLedger = row.try_into()?;

        let entry = ledger.buckets.get_mut(bucket);
        let new_balance = entry.balance.saturating_add(delta);
        if new_balance < 0 {
            return Err(LedgerError::InsufficientBalance {
                bucket,
                requested: delta.saturating_abs(),
                available: entry.balance,
            });
        }
        entry.balance = new_balance;
        if delta > 0 {
            entry.lifetime_added = entry.lifetime_added.saturating_add(delta);
        }
        entry.updated_at = now;

        Self::write_buckets(&mut tx, shop, &ledger.buckets, ledger.version + 1, now).await?;
        Self::insert_adjustment(
            &mut tx,
            shop,
            bucket,
            delta,
            new_balance,
            reason,
            idempotency_key,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(AdjustOutcome::Applied { new_balance })
    }

    async fn apply_consumption(
        &self,
        event: &UsageEvent,
        overage: Option<&OverageCharge>,
    ) -> LedgerResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = event.created_at;

        let claimed = sqlx::query(
            r#"
            INSERT INTO usage_events
                (idempotency_key, shop_domain, quantity,
                 trial_used, coupon_used, plan_used, purchased_used, overage_units, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&event.idempotency_key)
        .bind(event.shop.as_str())
        .bind(event.quantity)
        .bind(event.breakdown.trial)
        .bind(event.breakdown.coupon)
        .bind(event.breakdown.plan)
        .bind(event.breakdown.purchased)
        .bind(event.breakdown.overage_units)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            // Replay: surface the stored event without debiting again.
            let stored: Option<UsageEventRow> = sqlx::query_as(
                r#"
                SELECT idempotency_key, shop_domain, quantity,
                       trial_used, coupon_used, plan_used, purchased_used, overage_units, created_at
                FROM usage_events
                WHERE idempotency_key = $1
                "#,
            )
            .bind(&event.idempotency_key)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;

            let stored = stored.ok_or_else(|| {
                LedgerError::Database("usage event vanished during replay lookup".to_string())
            })?;
            return Ok(ApplyOutcome::Replayed {
                event: stored.try_into()?,
            });
        }

        let row = Self::lock_ledger(&mut tx, &event.shop).await?;
        let mut ledger: AccountLedger = row.try_into()?;

        for kind in BucketKind::PRIORITY {
            let debit = event.breakdown.get(kind);
            if debit == 0 {
                continue;
            }
            let entry = ledger.buckets.get_mut(kind);
            if debit > entry.balance {
                // Stale snapshot; the caller recomputes. The transaction is
                // dropped without commit so the claim above unwinds too.
                return Err(LedgerError::InsufficientBalance {
                    bucket: kind,
                    requested: debit,
                    available: entry.balance,
                });
            }
            entry.balance -= debit;
            entry.updated_at = now;
        }

        ledger.version += 1;
        ledger.updated_at = now;
        Self::write_buckets(&mut tx, &event.shop, &ledger.buckets, ledger.version, now).await?;

        for kind in BucketKind::PRIORITY {
            let debit = event.breakdown.get(kind);
            if debit == 0 {
                continue;
            }
            Self::insert_adjustment(
                &mut tx,
                &event.shop,
                kind,
                -debit,
                ledger.buckets.get(kind).balance,
                AdjustmentReason::Consumption,
                Some(&event.idempotency_key),
                now,
            )
            .await?;
        }

        if let Some(charge) = overage {
            sqlx::query(
                r#"
                INSERT INTO overage_charges
                    (id, shop_domain, units, unit_rate_cents, amount_cents,
                     usage_key, status, platform_charge_id, created_at, posted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(charge.id)
            .bind(charge.shop.as_str())
            .bind(charge.units)
            .bind(charge.unit_rate_cents)
            .bind(charge.amount_cents)
            .bind(&charge.usage_key)
            .bind(charge.status.as_str())
            .bind(charge.platform_charge_id.as_deref())
            .bind(charge.created_at)
            .bind(charge.posted_at)
            .execute(&mut *tx)
            .await?;
        }

        Self::claim_key(&mut tx, &event.idempotency_key, &event.shop, now).await?;

        tx.commit().await?;
        Ok(ApplyOutcome::Applied { ledger })
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
        let mut tx = self.pool.begin().await?;

        if !Self::claim_key(&mut tx, &key, shop, now).await? {
            return Ok(RenewalOutcome::Duplicate);
        }

        let row = Self::lock_ledger(&mut tx, shop).await?;
        let mut ledger: AccountLedger = row.try_into()?;

        // Additive carry-forward: the plan bucket only ever grows here.
        let entry = ledger.buckets.get_mut(BucketKind::Plan);
        entry.balance = entry.balance.saturating_add(period.included_credits);
        entry.lifetime_added = entry.lifetime_added.saturating_add(period.included_credits);
        entry.updated_at = now;
        let plan_balance = entry.balance;

        Self::write_buckets(&mut tx, shop, &ledger.buckets, ledger.version + 1, now).await?;
        Self::insert_adjustment(
            &mut tx,
            shop,
            BucketKind::Plan,
            period.included_credits,
            plan_balance,
            AdjustmentReason::PeriodRenewal,
            Some(&key),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(RenewalOutcome::Applied { plan_balance })
    }

    async fn set_trial_state(
        &self,
        shop: &ShopDomain,
        state: TrialState,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let (started_at, ended_at, reason) = match state {
            TrialState::NotStarted => (None, None, None),
            TrialState::Active { started_at } => (Some(started_at), None, None),
            TrialState::Ended {
                started_at,
                ended_at,
                reason,
            } => (Some(started_at), Some(ended_at), Some(reason.as_str())),
        };

        let result = sqlx::query(
            r#"
            UPDATE credit_ledgers SET
                trial_started_at = $2, trial_ended_at = $3, trial_end_reason = $4,
                version = version + 1, updated_at = $5
            WHERE shop_domain = $1
            "#,
        )
        .bind(shop.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound { shop: shop.clone() });
        }
        Ok(())
    }

    async fn usage_event(&self, usage_key: &str) -> LedgerResult<Option<UsageEvent>> {
        let row: Option<UsageEventRow> = sqlx::query_as(
            r#"
            SELECT idempotency_key, shop_domain, quantity,
                   trial_used, coupon_used, plan_used, purchased_used, overage_units, created_at
            FROM usage_events
            WHERE idempotency_key = $1
            "#,
        )
        .bind(usage_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn mark_overage_posted(
        &self,
        charge_id: Uuid,
        platform_charge_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE overage_charges
            SET status = 'posted', platform_charge_id = $2, posted_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(charge_id)
        .bind(platform_charge_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_overage_charges(&self, limit: i64) -> LedgerResult<Vec<OverageCharge>> {
        let rows: Vec<OverageChargeRow> = sqlx::query_as(
            r#"
            SELECT id, shop_domain, units, unit_rate_cents, amount_cents,
                   usage_key, status, platform_charge_id, created_at, posted_at
            FROM overage_charges
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn recent_adjustments(
        &self,
        shop: &ShopDomain,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerAdjustment>> {
        let rows: Vec<AdjustmentRow> = sqlx::query_as(
            r#"
            SELECT id, shop_domain, bucket, delta, balance_after, reason, idempotency_key, created_at
            FROM ledger_adjustments
            WHERE shop_domain = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(shop.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn purge_applied_keys(&self, older_than: OffsetDateTime) -> LedgerResult<u64> {
        let keys = sqlx::query("DELETE FROM applied_ledger_keys WHERE applied_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        let events = sqlx::query("DELETE FROM usage_events WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(keys.rows_affected() + events.rows_affected())
    }

    async fn expired_trials(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<ShopDomain>> {
        let cutoff = now - TRIAL_DURATION;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT shop_domain
            FROM credit_ledgers
            WHERE trial_started_at IS NOT NULL
              AND trial_ended_at IS NULL
              AND trial_started_at <= $1
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(domain,)| {
                ShopDomain::parse(&domain).map_err(|e| LedgerError::Database(e.to_string()))
            })
            .collect()
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    shop_domain: String,
    plan_tier: String,
    trial_started_at: Option<OffsetDateTime>,
    trial_ended_at: Option<OffsetDateTime>,
    trial_end_reason: Option<String>,
    trial_balance: i64,
    trial_lifetime: i64,
    coupon_balance: i64,
    coupon_lifetime: i64,
    plan_balance: i64,
    plan_lifetime: i64,
    purchased_balance: i64,
    purchased_lifetime: i64,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<LedgerRow> for AccountLedger {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let shop = ShopDomain::parse(&row.shop_domain)
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        let plan: PlanTier = row
            .plan_tier
            .parse()
            .map_err(|e: vesti_shared::PlanTierParseError| LedgerError::Database(e.to_string()))?;

        let trial = match (row.trial_started_at, row.trial_ended_at) {
            (None, _) => TrialState::NotStarted,
            (Some(started_at), None) => TrialState::Active { started_at },
            (Some(started_at), Some(ended_at)) => TrialState::Ended {
                started_at,
                ended_at,
                reason: row
                    .trial_end_reason
                    .as_deref()
                    .unwrap_or("duration_elapsed")
                    .parse()
                    .map_err(LedgerError::Database)?,
            },
        };

        let bucket = |balance: i64, lifetime: i64| CreditBucket {
            balance,
            lifetime_added: lifetime,
            updated_at: row.updated_at,
        };

        Ok(AccountLedger {
            shop,
            plan,
            trial,
            buckets: BucketSet {
                trial: bucket(row.trial_balance, row.trial_lifetime),
                coupon: bucket(row.coupon_balance, row.coupon_lifetime),
                plan: bucket(row.plan_balance, row.plan_lifetime),
                purchased: bucket(row.purchased_balance, row.purchased_lifetime),
            },
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageEventRow {
    idempotency_key: String,
    shop_domain: String,
    quantity: i64,
    trial_used: i64,
    coupon_used: i64,
    plan_used: i64,
    purchased_used: i64,
    overage_units: i64,
    created_at: OffsetDateTime,
}

impl TryFrom<UsageEventRow> for UsageEvent {
    type Error = LedgerError;

    fn try_from(row: UsageEventRow) -> Result<Self, Self::Error> {
        Ok(UsageEvent {
            shop: ShopDomain::parse(&row.shop_domain)
                .map_err(|e| LedgerError::Database(e.to_string()))?,
            idempotency_key: row.idempotency_key,
            quantity: row.quantity,
            breakdown: crate::model::DebitBreakdown {
                trial: row.trial_used,
                coupon: row.coupon_used,
                plan: row.plan_used,
                purchased: row.purchased_used,
                overage_units: row.overage_units,
            },
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AdjustmentRow {
    id: Uuid,
    shop_domain: String,
    bucket: String,
    delta: i64,
    balance_after: i64,
    reason: String,
    idempotency_key: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<AdjustmentRow> for LedgerAdjustment {
    type Error = LedgerError;

    fn try_from(row: AdjustmentRow) -> Result<Self, Self::Error> {
        Ok(LedgerAdjustment {
            id: row.id,
            shop: ShopDomain::parse(&row.shop_domain)
                .map_err(|e| LedgerError::Database(e.to_string()))?,
            bucket: row.bucket.parse().map_err(LedgerError::Database)?,
            delta: row.delta,
            balance_after: row.balance_after,
            reason: row.reason.parse().map_err(LedgerError::Database)?,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OverageChargeRow {
    id: Uuid,
    shop_domain: String,
    units: i64,
    unit_rate_cents: i64,
    amount_cents: i64,
    usage_key: String,
    status: String,
    platform_charge_id: Option<String>,
    created_at: OffsetDateTime,
    posted_at: Option<OffsetDateTime>,
}

impl TryFrom<OverageChargeRow> for OverageCharge {
    type Error = LedgerError;

    fn try_from(row: OverageChargeRow) -> Result<Self, Self::Error> {
        Ok(OverageCharge {
            id: row.id,
            shop: ShopDomain::parse(&row.shop_domain)
                .map_err(|e| LedgerError::Database(e.to_string()))?,
            units: row.units,
            unit_rate_cents: row.unit_rate_cents,
            amount_cents: row.amount_cents,
            usage_key: row.usage_key,
            status: row.status.parse().map_err(LedgerError::Database)?,
            platform_charge_id: row.platform_charge_id,
            created_at: row.created_at,
            posted_at: row.posted_at,
        })
    }
}
