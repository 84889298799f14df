//! Ledger error types.
//!
//! Most failures are resolved inside the engine: `InsufficientBalance` is
//! routed around by priority fallthrough and commit retries, and
//! `DuplicateTransaction` is converted to a success-no-op so webhook retries
//! stay safe. Only `OverageUnavailable` and `InvalidAdjustment` cross the
//! crate boundary to callers.

use vesti_shared::ShopDomain;

use crate::model::BucketKind;

/// Convenience result alias used throughout the ledger crate.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// A negative adjustment would drive a bucket below zero. Internal: the
    /// consumption engine treats this as a stale snapshot and recomputes;
    /// it is never surfaced from `consume`.
    #[error("insufficient {bucket} balance: requested {requested}, available {available}")]
    InsufficientBalance {
        bucket: BucketKind,
        requested: i64,
        available: i64,
    },

    /// Overage billing was required but the account has no usable payment
    /// method (or the payment check timed out). The only consume-path
    /// failure; callers must block the triggering action and prompt the
    /// merchant to add a payment method.
    #[error("overage billing unavailable for {shop}: {reason}")]
    OverageUnavailable { shop: ShopDomain, reason: String },

    /// A replayed idempotency key. Services convert this to a success-no-op
    /// before it reaches a caller.
    #[error("duplicate transaction '{key}'")]
    DuplicateTransaction { key: String },

    /// Malformed adjustment request, rejected before any stored state is
    /// touched.
    #[error("invalid adjustment: {reason}")]
    InvalidAdjustment { reason: String },

    #[error("no ledger found for shop '{shop}'")]
    AccountNotFound { shop: ShopDomain },

    #[error("database error: {0}")]
    Database(String),

    #[error("billing gateway error: {0}")]
    Gateway(String),
}

impl LedgerError {
    /// Whether the consumption engine may retry the operation that produced
    /// this error. Stale-snapshot conflicts are retryable; validation and
    /// gateway refusals are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InsufficientBalance { .. })
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}
