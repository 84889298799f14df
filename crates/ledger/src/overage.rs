//! Metered overage billing.
//!
//! Once all four credit buckets are exhausted, the remainder of a usage
//! request is billed per unit at a fixed plan rate. The payment-method check
//! runs before any bucket is debited and is bounded by a timeout so a slow
//! platform call can never wedge an account; the usage charge itself is
//! posted after commit with retries, and unposted charges are re-driven by
//! the worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use vesti_shared::{PlanTier, ShopDomain};

use crate::error::{LedgerError, LedgerResult};
use crate::model::{OverageCharge, OverageChargeStatus};

/// Upper bound on the platform payment-method check. A timeout surfaces as
/// `OverageUnavailable` instead of holding the account's adjustment scope.
pub const PAYMENT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed per-unit overage rate for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverageRates {
    /// Cents charged per generation beyond all credit buckets.
    pub unit_rate_cents: i64,
}

impl OverageRates {
    /// Rate for a subscription tier. Every tier bills overage; the rate is a
    /// constant, not merchant-configurable.
    #[must_use]
    pub fn for_tier(tier: PlanTier) -> Self {
        Self {
            unit_rate_cents: tier.overage_unit_rate_cents(),
        }
    }

    /// Total charge for `units` of overage, in cents. Saturates rather than
    /// overflowing; zero or negative unit counts charge nothing.
    #[must_use]
    pub fn charge_cents(&self, units: i64) -> i64 {
        if units <= 0 {
            return 0;
        }
        units.saturating_mul(self.unit_rate_cents)
    }
}

/// The commerce platform's billing surface, as seen by this engine.
///
/// Subscription creation/cancellation lives elsewhere; the ledger only needs
/// to check for a usable billing method and to post metered usage charges.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Whether the merchant has an active subscription with a usable payment
    /// method on file.
    async fn has_billing_method(&self, shop: &ShopDomain) -> LedgerResult<bool>;

    /// Post a metered usage charge; returns the platform charge identifier.
    /// Must be idempotent on `idempotency_key` at the platform side.
    async fn post_usage_charge(
        &self,
        shop: &ShopDomain,
        units: i64,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> LedgerResult<String>;
}

/// Computes overage charges and talks to the platform billing API.
#[derive(Clone)]
pub struct OverageBiller {
    gateway: Arc<dyn BillingGateway>,
    check_timeout: Duration,
}

impl OverageBiller {
    pub fn new(gateway: Arc<dyn BillingGateway>) -> Self {
        Self {
            gateway,
            check_timeout: PAYMENT_CHECK_TIMEOUT,
        }
    }

    /// Override the payment-check timeout (tests use a short one).
    #[must_use]
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Verify the account can be billed for overage. Runs BEFORE any bucket
    /// is debited; every failure mode maps to `OverageUnavailable` so the
    /// caller can block the triggering action with an actionable message.
    pub async fn ensure_billable(&self, shop: &ShopDomain) -> LedgerResult<()> {
        let check = self.gateway.has_billing_method(shop);
        match tokio::time::timeout(self.check_timeout, check).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(LedgerError::OverageUnavailable {
                shop: shop.clone(),
                reason: "no billing method on file".to_string(),
            }),
            Ok(Err(e)) => Err(LedgerError::OverageUnavailable {
                shop: shop.clone(),
                reason: format!("billing method check failed: {e}"),
            }),
            Err(_) => Err(LedgerError::OverageUnavailable {
                shop: shop.clone(),
                reason: format!(
                    "billing method check timed out after {:?}",
                    self.check_timeout
                ),
            }),
        }
    }

    /// Build the charge record for a committed overage remainder.
    #[must_use]
    pub fn draft_charge(
        &self,
        shop: &ShopDomain,
        units: i64,
        rates: OverageRates,
        usage_key: &str,
        now: OffsetDateTime,
    ) -> OverageCharge {
        OverageCharge {
            id: Uuid::new_v4(),
            shop: shop.clone(),
            units,
            unit_rate_cents: rates.unit_rate_cents,
            amount_cents: rates.charge_cents(units),
            usage_key: usage_key.to_string(),
            status: OverageChargeStatus::Pending,
            platform_charge_id: None,
            created_at: now,
            posted_at: None,
        }
    }

    /// Post a charge to the platform with exponential backoff. A charge that
    /// still fails stays `pending` and is retried by the worker.
    pub async fn post_charge(&self, charge: &OverageCharge) -> LedgerResult<String> {
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);

        let gateway = self.gateway.clone();
        let platform_charge_id = Retry::spawn(strategy, || {
            gateway.post_usage_charge(
                &charge.shop,
                charge.units,
                charge.amount_cents,
                &charge.usage_key,
            )
        })
        .await?;

        tracing::info!(
            shop = %charge.shop,
            units = charge.units,
            amount_cents = charge.amount_cents,
            platform_charge_id = %platform_charge_id,
            "Posted overage usage charge"
        );

        Ok(platform_charge_id)
    }
}

/// Platform billing API client over HTTP.
pub struct HttpBillingGateway {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct BillingMethodResponse {
    has_billing_method: bool,
}

#[derive(Debug, Deserialize)]
struct UsageChargeResponse {
    charge_id: String,
}

impl HttpBillingGateway {
    pub fn new(base_url: String, api_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_token,
        }
    }
}

#[async_trait]
impl BillingGateway for HttpBillingGateway {
    async fn has_billing_method(&self, shop: &ShopDomain) -> LedgerResult<bool> {
        let url = format!("{}/merchants/{}/billing-method", self.base_url, shop);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        let body: BillingMethodResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        Ok(body.has_billing_method)
    }

    async fn post_usage_charge(
        &self,
        shop: &ShopDomain,
        units: i64,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> LedgerResult<String> {
        let url = format!("{}/merchants/{}/usage-charges", self.base_url, shop);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({
                "units": units,
                "amount_cents": amount_cents,
                "idempotency_key": idempotency_key,
            }))
            .send()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        let body: UsageChargeResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        Ok(body.charge_id)
    }
}

/// Mock billing gateway for testing.
#[cfg(any(test, feature = "test-gateway"))]
#[allow(clippy::unwrap_used)]
pub mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::RwLock;

    /// Configurable in-memory gateway: toggle the billing method, inject
    /// check latency, or make charge posting fail.
    #[derive(Clone, Default)]
    pub struct MockBillingGateway {
        inner: Arc<MockInner>,
    }

    #[derive(Default)]
    struct MockInner {
        has_method: AtomicBool,
        fail_posts: AtomicBool,
        check_delay: RwLock<Option<Duration>>,
        posted: RwLock<Vec<(ShopDomain, i64, i64, String)>>,
    }

    impl MockBillingGateway {
        /// A gateway with a billing method on file.
        #[must_use]
        pub fn billable() -> Self {
            let gateway = Self::default();
            gateway.inner.has_method.store(true, Ordering::SeqCst);
            gateway
        }

        /// A gateway with no billing method.
        #[must_use]
        pub fn without_billing_method() -> Self {
            Self::default()
        }

        pub fn set_has_method(&self, value: bool) {
            self.inner.has_method.store(value, Ordering::SeqCst);
        }

        pub fn set_fail_posts(&self, value: bool) {
            self.inner.fail_posts.store(value, Ordering::SeqCst);
        }

        /// Delay every billing-method check (for timeout tests).
        pub fn set_check_delay(&self, delay: Duration) {
            *self.inner.check_delay.write().unwrap() = Some(delay);
        }

        /// Charges posted so far, in order.
        pub fn posted_charges(&self) -> Vec<(ShopDomain, i64, i64, String)> {
            self.inner.posted.read().unwrap().clone()
        }
    }

    #[async_trait]
    impl BillingGateway for MockBillingGateway {
        async fn has_billing_method(&self, _shop: &ShopDomain) -> LedgerResult<bool> {
            let delay = *self.inner.check_delay.read().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.inner.has_method.load(Ordering::SeqCst))
        }

        async fn post_usage_charge(
            &self,
            shop: &ShopDomain,
            units: i64,
            amount_cents: i64,
            idempotency_key: &str,
        ) -> LedgerResult<String> {
            if self.inner.fail_posts.load(Ordering::SeqCst) {
                return Err(LedgerError::Gateway("usage charge rejected".to_string()));
            }
            self.inner.posted.write().unwrap().push((
                shop.clone(),
                units,
                amount_cents,
                idempotency_key.to_string(),
            ));
            Ok(format!("charge_{}", Uuid::new_v4()))
        }
    }
}
