//! Coupon redemption.
//!
//! One-shot credit additions into the coupon bucket. The server-side catalog
//! is authoritative for which codes exist and what they are worth; a code
//! redeems at most once per account, and replays (retried requests carrying
//! the same transaction id) are success-no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;

use vesti_shared::ShopDomain;

use crate::error::{LedgerError, LedgerResult};
use crate::model::{AdjustmentReason, BalanceSummary, BucketKind};
use crate::store::{AdjustOutcome, LedgerStore};

/// Known coupon codes and their credit values.
#[derive(Debug, Clone, Default)]
pub struct CouponCatalog {
    codes: HashMap<String, i64>,
}

impl CouponCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from `CODE=credits` pairs.
    #[must_use]
    pub fn with_codes(codes: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            codes: codes
                .into_iter()
                .map(|(code, credits)| (code.to_ascii_uppercase(), credits))
                .collect(),
        }
    }

    /// Parse the catalog from the `COUPON_CODES` environment variable
    /// (`WELCOME50=50,LAUNCH25=25`). Missing or malformed entries are
    /// skipped with a warning so one bad code cannot take down startup.
    #[must_use]
    pub fn from_env() -> Self {
        let raw = std::env::var("COUPON_CODES").unwrap_or_default();
        let mut codes = HashMap::new();

        for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
            match entry.trim().split_once('=') {
                Some((code, credits)) => match credits.parse::<i64>() {
                    Ok(credits) if credits > 0 => {
                        codes.insert(code.trim().to_ascii_uppercase(), credits);
                    }
                    _ => {
                        tracing::warn!(entry = entry, "Skipping coupon with invalid credit value");
                    }
                },
                None => {
                    tracing::warn!(entry = entry, "Skipping malformed coupon entry");
                }
            }
        }

        tracing::info!(count = codes.len(), "Coupon catalog loaded");
        Self { codes }
    }

    /// Credit value for a code, case-insensitive.
    #[must_use]
    pub fn credits_for(&self, code: &str) -> Option<i64> {
        self.codes.get(&code.trim().to_ascii_uppercase()).copied()
    }
}

/// Outcome of a redemption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionResult {
    pub credited: i64,
    pub balances: BalanceSummary,
    /// True when the code had already been redeemed by this account (or the
    /// request is a replay); nothing was credited this time.
    pub already_redeemed: bool,
}

/// Redeems coupon codes into the coupon bucket.
#[derive(Clone)]
pub struct CouponRedemptionService {
    store: Arc<dyn LedgerStore>,
    catalog: CouponCatalog,
}

impl CouponRedemptionService {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: CouponCatalog) -> Self {
        Self { store, catalog }
    }

    /// Redeem `code` for `shop`. Idempotent: the account-scoped redemption
    /// key covers both a retried transaction and a second attempt at an
    /// already-redeemed code.
    pub async fn redeem(
        &self,
        shop: &ShopDomain,
        code: &str,
        transaction_id: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<RedemptionResult> {
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidAdjustment {
                reason: "transaction id must not be empty".to_string(),
            });
        }

        let credits = self
            .catalog
            .credits_for(code)
            .ok_or_else(|| LedgerError::InvalidAdjustment {
                reason: format!("unknown coupon code '{code}'"),
            })?;

        let key = redemption_key(shop, code);
        let outcome = self
            .store
            .adjust(
                shop,
                BucketKind::Coupon,
                credits,
                AdjustmentReason::CouponRedemption,
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
                    code = code,
                    transaction_id = transaction_id,
                    credited = credits,
                    coupon_balance = new_balance,
                    "Coupon redeemed"
                );
                Ok(RedemptionResult {
                    credited: credits,
                    balances: BalanceSummary::of(&ledger),
                    already_redeemed: false,
                })
            }
            AdjustOutcome::Duplicate => {
                tracing::info!(
                    shop = %shop,
                    code = code,
                    transaction_id = transaction_id,
                    "Coupon already redeemed; no-op"
                );
                Ok(RedemptionResult {
                    credited: 0,
                    balances: BalanceSummary::of(&ledger),
                    already_redeemed: true,
                })
            }
        }
    }
}

fn redemption_key(shop: &ShopDomain, code: &str) -> String {
    format!("coupon:{shop}:{}", code.trim().to_ascii_uppercase())
}
