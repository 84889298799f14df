//! Ledger data model.
//!
//! One parameterized bucket type tagged by [`BucketKind`] replaces four
//! parallel credit fields; consumption, renewal, and redemption all iterate
//! the same closed enumeration in its declared priority order.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use vesti_shared::{PlanTier, ShopDomain};

/// The four credit pools tracked per merchant account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Trial,
    Coupon,
    Plan,
    Purchased,
}

impl BucketKind {
    /// Fixed consumption order. Trial and promotional credit are spent first
    /// (time- or goodwill-limited), plan credit next (replenished each
    /// period), purchased credit last (paid for explicitly, preserved
    /// longest). Not configurable.
    pub const PRIORITY: [BucketKind; 4] = [
        BucketKind::Trial,
        BucketKind::Coupon,
        BucketKind::Plan,
        BucketKind::Purchased,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Coupon => "coupon",
            Self::Plan => "plan",
            Self::Purchased => "purchased",
        }
    }
}

impl std::fmt::Display for BucketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BucketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "coupon" => Ok(Self::Coupon),
            "plan" => Ok(Self::Plan),
            "purchased" => Ok(Self::Purchased),
            other => Err(format!("unknown bucket kind '{other}'")),
        }
    }
}

/// A single credit pool: current balance plus a lifetime-added total for
/// audit. Balance is never negative and is never reset by a renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBucket {
    pub balance: i64,
    pub lifetime_added: i64,
    pub updated_at: OffsetDateTime,
}

impl CreditBucket {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            balance: 0,
            lifetime_added: 0,
            updated_at: now,
        }
    }
}

/// All four buckets for one account, addressable by [`BucketKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSet {
    pub trial: CreditBucket,
    pub coupon: CreditBucket,
    pub plan: CreditBucket,
    pub purchased: CreditBucket,
}

impl BucketSet {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            trial: CreditBucket::empty(now),
            coupon: CreditBucket::empty(now),
            plan: CreditBucket::empty(now),
            purchased: CreditBucket::empty(now),
        }
    }

    #[must_use]
    pub fn get(&self, kind: BucketKind) -> &CreditBucket {
        match kind {
            BucketKind::Trial => &self.trial,
            BucketKind::Coupon => &self.coupon,
            BucketKind::Plan => &self.plan,
            BucketKind::Purchased => &self.purchased,
        }
    }

    pub fn get_mut(&mut self, kind: BucketKind) -> &mut CreditBucket {
        match kind {
            BucketKind::Trial => &mut self.trial,
            BucketKind::Coupon => &mut self.coupon,
            BucketKind::Plan => &mut self.plan,
            BucketKind::Purchased => &mut self.purchased,
        }
    }

    /// Sum of all four balances.
    #[must_use]
    pub fn total(&self) -> i64 {
        BucketKind::PRIORITY
            .iter()
            .map(|k| self.get(*k).balance)
            .sum()
    }
}

/// Read-only balance view returned to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub trial: i64,
    pub coupon: i64,
    pub plan: i64,
    pub purchased: i64,
    pub total: i64,
    pub trial_active: bool,
}

impl BalanceSummary {
    #[must_use]
    pub fn of(ledger: &AccountLedger) -> Self {
        Self {
            trial: ledger.buckets.trial.balance,
            coupon: ledger.buckets.coupon.balance,
            plan: ledger.buckets.plan.balance,
            purchased: ledger.buckets.purchased.balance,
            total: ledger.buckets.total(),
            trial_active: ledger.trial.is_active(),
        }
    }
}

/// Why a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialEndReason {
    /// 30 days elapsed since the trial started.
    DurationElapsed,
    /// Explicit administrative "trial consumed" signal.
    Consumed,
}

impl TrialEndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DurationElapsed => "duration_elapsed",
            Self::Consumed => "consumed",
        }
    }
}

impl std::str::FromStr for TrialEndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "duration_elapsed" => Ok(Self::DurationElapsed),
            "consumed" => Ok(Self::Consumed),
            other => Err(format!("unknown trial end reason '{other}'")),
        }
    }
}

/// Trial lifecycle state. Ending a trial flips state only; the trial bucket
/// balance is untouched and remains spendable at trial-first priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrialState {
    NotStarted,
    Active {
        started_at: OffsetDateTime,
    },
    Ended {
        started_at: OffsetDateTime,
        ended_at: OffsetDateTime,
        reason: TrialEndReason,
    },
}

impl TrialState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// One merchant account's complete ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLedger {
    pub shop: ShopDomain,
    pub plan: PlanTier,
    pub trial: TrialState,
    pub buckets: BucketSet,
    /// Monotonic mutation counter; every committed adjustment increments it.
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// How a consumption request was split across buckets, plus any remainder
/// that escalated to metered overage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitBreakdown {
    pub trial: i64,
    pub coupon: i64,
    pub plan: i64,
    pub purchased: i64,
    pub overage_units: i64,
}

impl DebitBreakdown {
    #[must_use]
    pub fn get(&self, kind: BucketKind) -> i64 {
        match kind {
            BucketKind::Trial => self.trial,
            BucketKind::Coupon => self.coupon,
            BucketKind::Plan => self.plan,
            BucketKind::Purchased => self.purchased,
        }
    }

    pub fn set(&mut self, kind: BucketKind, amount: i64) {
        match kind {
            BucketKind::Trial => self.trial = amount,
            BucketKind::Coupon => self.coupon = amount,
            BucketKind::Plan => self.plan = amount,
            BucketKind::Purchased => self.purchased = amount,
        }
    }

    /// Units drawn from buckets (excludes the overage remainder).
    #[must_use]
    pub fn bucket_total(&self) -> i64 {
        self.trial + self.coupon + self.plan + self.purchased
    }
}

/// One recorded consumption attempt, keyed by the caller's idempotency key.
/// Replays return the stored record instead of debiting again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub shop: ShopDomain,
    pub idempotency_key: String,
    pub quantity: i64,
    pub breakdown: DebitBreakdown,
    pub created_at: OffsetDateTime,
}

/// A billing-period-change notification from the platform webhook receiver.
/// `period_id` is the idempotency key: applying the same period twice must
/// not double-add credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub period_id: String,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub included_credits: i64,
}

/// Lifecycle of an overage charge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverageChargeStatus {
    /// Debits committed; the usage charge has not reached the platform yet.
    Pending,
    /// The platform accepted the usage charge.
    Posted,
}

impl OverageChargeStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Posted => "posted",
        }
    }
}

impl std::str::FromStr for OverageChargeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "posted" => Ok(Self::Posted),
            other => Err(format!("unknown overage charge status '{other}'")),
        }
    }
}

/// Metered charge created when a usage request exceeds every bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverageCharge {
    pub id: Uuid,
    pub shop: ShopDomain,
    pub units: i64,
    pub unit_rate_cents: i64,
    pub amount_cents: i64,
    /// Idempotency key of the usage event that produced this charge.
    pub usage_key: String,
    pub status: OverageChargeStatus,
    pub platform_charge_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub posted_at: Option<OffsetDateTime>,
}

/// Reason tag recorded with every bucket adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    TrialGrant,
    PeriodRenewal,
    CouponRedemption,
    CreditPurchase,
    Consumption,
}

impl AdjustmentReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrialGrant => "trial_grant",
            Self::PeriodRenewal => "period_renewal",
            Self::CouponRedemption => "coupon_redemption",
            Self::CreditPurchase => "credit_purchase",
            Self::Consumption => "consumption",
        }
    }
}

impl std::fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AdjustmentReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial_grant" => Ok(Self::TrialGrant),
            "period_renewal" => Ok(Self::PeriodRenewal),
            "coupon_redemption" => Ok(Self::CouponRedemption),
            "credit_purchase" => Ok(Self::CreditPurchase),
            "consumption" => Ok(Self::Consumption),
            other => Err(format!("unknown adjustment reason '{other}'")),
        }
    }
}

/// Audit entry written for every committed bucket mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAdjustment {
    pub id: Uuid,
    pub shop: ShopDomain,
    pub bucket: BucketKind,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: AdjustmentReason,
    pub idempotency_key: Option<String>,
    pub created_at: OffsetDateTime,
}
