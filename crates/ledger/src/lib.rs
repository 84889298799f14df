// Ledger crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Audit-entry writers thread full adjustment context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vesti Credit Ledger
//!
//! Multi-bucket usage-credit ledger and billing reconciliation engine.
//!
//! ## Features
//!
//! - **Four credit buckets per account**: trial, coupon, plan, purchased -
//!   independently sourced, never expiring, never reset by renewals
//! - **Priority consumption**: fixed trial → coupon → plan → purchased
//!   drain order, with metered overage once all buckets are exhausted
//! - **Trial lifecycle**: 30-day window evaluated lazily, unused trial
//!   credit stays spendable after the trial ends
//! - **Additive period renewal**: plan credits carry forward; period ids
//!   de-duplicate webhook redelivery
//! - **Coupon & purchase credits**: one-shot additions, idempotent on the
//!   source transaction id
//! - **Audit trail**: every adjustment recorded with a reason tag

pub mod consumption;
pub mod coupons;
pub mod error;
pub mod model;
pub mod overage;
pub mod pg_store;
pub mod purchases;
pub mod renewal;
pub mod store;
pub mod trial;

#[cfg(test)]
mod edge_case_tests;

// Consumption
pub use consumption::{plan_debits, ConsumptionEngine, ConsumptionResult, OverageSummary};

// Coupons
pub use coupons::{CouponCatalog, CouponRedemptionService, RedemptionResult};

// Error
pub use error::{LedgerError, LedgerResult};

// Model
pub use model::{
    AccountLedger, AdjustmentReason, BalanceSummary, BillingPeriod, BucketKind, BucketSet,
    CreditBucket, DebitBreakdown, LedgerAdjustment, OverageCharge, OverageChargeStatus,
    TrialEndReason, TrialState, UsageEvent,
};

// Overage
pub use overage::{
    BillingGateway, HttpBillingGateway, OverageBiller, OverageRates, PAYMENT_CHECK_TIMEOUT,
};

// Purchases
pub use purchases::{PurchaseCreditService, PurchaseResult};

// Renewal
pub use renewal::{PeriodRenewalReconciler, RenewalNotification};

// Store
pub use pg_store::PgLedgerStore;
pub use store::{AdjustOutcome, ApplyOutcome, LedgerStore, MemoryLedgerStore, RenewalOutcome};

// Trial
pub use trial::{trial_status, TrialLifecycleManager, TrialStatus};

// Test exports
#[cfg(any(test, feature = "test-gateway"))]
pub use overage::test::MockBillingGateway;

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;

use vesti_shared::{PlanTier, ShopDomain};

/// Main ledger service that combines all credit-ledger functionality.
#[derive(Clone)]
pub struct LedgerService {
    pub store: Arc<dyn LedgerStore>,
    pub consumption: ConsumptionEngine,
    pub trial: TrialLifecycleManager,
    pub renewal: PeriodRenewalReconciler,
    pub coupons: CouponRedemptionService,
    pub purchases: PurchaseCreditService,
    pub overage: OverageBiller,
}

impl LedgerService {
    /// Wire the service from explicit parts.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BillingGateway>,
        catalog: CouponCatalog,
    ) -> Self {
        let overage = OverageBiller::new(gateway);
        Self {
            consumption: ConsumptionEngine::new(store.clone(), overage.clone()),
            trial: TrialLifecycleManager::new(store.clone()),
            renewal: PeriodRenewalReconciler::new(store.clone()),
            coupons: CouponRedemptionService::new(store.clone(), catalog),
            purchases: PurchaseCreditService::new(store.clone()),
            overage,
            store,
        }
    }

    /// Create the service from environment variables with a Postgres store.
    pub fn from_env(pool: PgPool) -> LedgerResult<Self> {
        let base_url = std::env::var("PLATFORM_BILLING_API_URL")
            .map_err(|_| LedgerError::Gateway("PLATFORM_BILLING_API_URL not set".to_string()))?;
        let api_token = std::env::var("PLATFORM_BILLING_API_TOKEN")
            .map_err(|_| LedgerError::Gateway("PLATFORM_BILLING_API_TOKEN not set".to_string()))?;

        let store = Arc::new(PgLedgerStore::new(pool));
        let gateway = Arc::new(HttpBillingGateway::new(base_url, api_token));
        Ok(Self::new(store, gateway, CouponCatalog::from_env()))
    }

    /// Create the account ledger at install time. Idempotent.
    pub async fn install_account(
        &self,
        shop: &ShopDomain,
        plan: PlanTier,
        now: OffsetDateTime,
    ) -> LedgerResult<BalanceSummary> {
        let ledger = self.store.create_account(shop, plan, now).await?;
        Ok(BalanceSummary::of(&ledger))
    }

    /// Read-only balance view. Reconciles lazy trial expiry on access.
    pub async fn balances(
        &self,
        shop: &ShopDomain,
        now: OffsetDateTime,
    ) -> LedgerResult<BalanceSummary> {
        self.trial.reconcile(shop, now).await?;
        let ledger = self
            .store
            .get_ledger(shop)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;
        Ok(BalanceSummary::of(&ledger))
    }

    /// Recent audit entries for an account, newest first.
    pub async fn history(
        &self,
        shop: &ShopDomain,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerAdjustment>> {
        self.store.recent_adjustments(shop, limit).await
    }
}
