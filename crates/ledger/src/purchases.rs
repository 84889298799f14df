//! Purchased credit packs.
//!
//! Confirmed one-time purchases land in the purchased bucket, which sits
//! last in consumption priority: paid-for credit is preserved longest.
//! Confirmations arrive from the payment-completion handler and may be
//! retried; the purchase transaction id dedupes them.

use std::sync::Arc;

use time::OffsetDateTime;

use vesti_shared::ShopDomain;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{AdjustmentReason, BalanceSummary, BucketKind};
use crate::store::{AdjustOutcome, LedgerStore};

/// Outcome of a purchase confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseResult {
    pub credited: i64,
    pub balances: BalanceSummary,
    /// True when this transaction id was already applied; nothing was
    /// credited this time.
    pub already_applied: bool,
}

/// Credits confirmed credit-pack purchases.
#[derive(Clone)]
pub struct PurchaseCreditService {
    store: Arc<dyn LedgerStore>,
}

impl PurchaseCreditService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Apply a confirmed purchase. Idempotent on `transaction_id`.
    pub async fn confirm(
        &self,
        shop: &ShopDomain,
        package_id: &str,
        credit_amount: i64,
        transaction_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<PurchaseResult> {
        if package_id.is_empty() {
            return Err(LedgerError::InvalidAdjustment {
                reason: "package id must not be empty".to_string(),
            });
        }
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidAdjustment {
                reason: "transaction id must not be empty".to_string(),
            });
        }
        if credit_amount <= 0 {
            return Err(LedgerError::InvalidAdjustment {
                reason: format!("credit amount must be positive, got {credit_amount}"),
            });
        }

        let key = format!("purchase:{transaction_id}");
        let outcome = self
            .store
            .adjust(
                shop,
                BucketKind::Purchased,
                credit_amount,
                AdjustmentReason::CreditPurchase,
                Some(&key),
                now,
            )
            .await?;

        let ledger = self
            .store
            .get_ledger(shop)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;

        match outcome {
            AdjustOutcome::Applied { new_balance } => {
                tracing::info!(
                    shop = %shop,
                    package_id = package_id,
                    transaction_id = transaction_id,
                    credited = credit_amount,
                    purchased_balance = new_balance,
                    "Credit purchase applied"
                );
                Ok(PurchaseResult {
                    credited: credit_amount,
                    balances: BalanceSummary::of(&ledger),
                    already_applied: false,
                })
            }
            AdjustOutcome::Duplicate => {
                tracing::info!(
                    shop = %shop,
                    transaction_id = transaction_id,
                    "Replayed purchase confirmation; no-op"
                );
                Ok(PurchaseResult {
                    credited: 0,
                    balances: BalanceSummary::of(&ledger),
                    already_applied: true,
                })
            }
        }
    }
}
