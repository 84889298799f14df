//! Core domain types shared across Vesti crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

/// Credits granted when a merchant's trial starts.
pub const TRIAL_ALLOTMENT: i64 = 100;

/// Fixed trial length. Evaluated lazily on access; no timer runs against it.
pub const TRIAL_DURATION: Duration = Duration::days(30);

/// Normalized shop domain, the stable account identifier for a merchant.
///
/// The commerce platform reports shop domains in several shapes
/// (`Example-Shop.myshopify.com`, `https://example-shop.myshopify.com/`,
/// bare `example-shop`). Every entry point normalizes through this type so
/// the ledger only ever sees one canonical spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ShopDomain(String);

/// Error returned when a shop domain cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shop domain '{input}': {reason}")]
pub struct ShopDomainError {
    pub input: String,
    pub reason: &'static str,
}

impl ShopDomain {
    /// Normalize a raw shop identifier into its canonical form.
    ///
    /// Strips scheme and trailing slashes, lowercases, and appends the
    /// platform suffix when given a bare store handle.
    pub fn parse(raw: &str) -> Result<Self, ShopDomainError> {
        let trimmed = raw
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');

        if trimmed.is_empty() {
            return Err(ShopDomainError {
                input: raw.to_string(),
                reason: "empty after normalization",
            });
        }

        let lowered = trimmed.to_ascii_lowercase();

        if lowered.contains('/') || lowered.contains(' ') {
            return Err(ShopDomainError {
                input: raw.to_string(),
                reason: "contains path or whitespace",
            });
        }

        let canonical = if lowered.contains('.') {
            lowered
        } else {
            format!("{lowered}.myshopify.com")
        };

        if !canonical
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(ShopDomainError {
                input: raw.to_string(),
                reason: "contains characters outside [a-z0-9.-]",
            });
        }

        Ok(Self(canonical))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription plan tiers offered to merchants.
///
/// Each tier carries a per-period included-credit allotment and a fixed
/// overage rate. Overage rates are constants, not merchant-configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Growth,
    Scale,
}

impl PlanTier {
    /// Credits included with each billing period on this tier.
    ///
    /// Renewals ADD this amount to the plan bucket; they never reset it.
    #[must_use]
    pub fn included_credits(&self) -> i64 {
        match self {
            Self::Starter => 200,
            Self::Growth => 500,
            Self::Scale => 1500,
        }
    }

    /// Metered overage rate in cents per generation once all credit
    /// buckets are exhausted.
    #[must_use]
    pub fn overage_unit_rate_cents(&self) -> i64 {
        match self {
            Self::Starter => 30,
            Self::Growth => 25,
            Self::Scale => 20,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Growth => "growth",
            Self::Scale => "scale",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a plan tier string is unrecognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan tier '{0}'")]
pub struct PlanTierParseError(pub String);

impl FromStr for PlanTier {
    type Err = PlanTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(Self::Starter),
            "growth" => Ok(Self::Growth),
            "scale" => Ok(Self::Scale),
            other => Err(PlanTierParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shop_domain_normalization() {
        let canonical = ShopDomain::parse("Example-Shop.myshopify.com").unwrap();
        assert_eq!(canonical.as_str(), "example-shop.myshopify.com");

        let from_url = ShopDomain::parse("https://example-shop.myshopify.com/").unwrap();
        assert_eq!(from_url, canonical);

        let from_handle = ShopDomain::parse("example-shop").unwrap();
        assert_eq!(from_handle, canonical);
    }

    #[test]
    fn test_shop_domain_rejects_garbage() {
        assert!(ShopDomain::parse("").is_err());
        assert!(ShopDomain::parse("   ").is_err());
        assert!(ShopDomain::parse("shop.example.com/admin").is_err());
        assert!(ShopDomain::parse("shop name.myshopify.com").is_err());
    }

    #[test]
    fn test_plan_tier_round_trip() {
        for tier in [PlanTier::Starter, PlanTier::Growth, PlanTier::Scale] {
            assert_eq!(tier.as_str().parse::<PlanTier>().unwrap(), tier);
        }
        assert!("enterprise".parse::<PlanTier>().is_err());
    }

    #[test]
    fn test_tier_credit_allotments() {
        assert_eq!(PlanTier::Starter.included_credits(), 200);
        assert_eq!(PlanTier::Growth.included_credits(), 500);
        assert_eq!(PlanTier::Scale.included_credits(), 1500);
    }

    #[test]
    fn test_tier_overage_rates_are_positive() {
        for tier in [PlanTier::Starter, PlanTier::Growth, PlanTier::Scale] {
            assert!(tier.overage_unit_rate_cents() > 0);
        }
        // Higher tiers pay less per unit
        assert!(
            PlanTier::Scale.overage_unit_rate_cents() < PlanTier::Starter.overage_unit_rate_cents()
        );
    }
}
