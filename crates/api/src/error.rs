//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use vesti_ledger::LedgerError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned to HTTP clients as JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Overage billing blocked: the merchant must add a payment method. The
    /// message is actionable on purpose - the triggering feature halts
    /// visibly, never silently.
    #[error("{0}")]
    PaymentRequired(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error serving request");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match &err {
            LedgerError::OverageUnavailable { .. } => Self::PaymentRequired(format!(
                "{err}. Add a payment method to continue generating try-ons."
            )),
            LedgerError::InvalidAdjustment { .. } => Self::BadRequest(err.to_string()),
            LedgerError::AccountNotFound { .. } => Self::NotFound(err.to_string()),
            // Internal taxonomy; these are resolved inside the engine and
            // should not normally escape.
            LedgerError::InsufficientBalance { .. }
            | LedgerError::DuplicateTransaction { .. }
            | LedgerError::Database(_)
            | LedgerError::Gateway(_) => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesti_shared::ShopDomain;

    #[test]
    fn test_overage_unavailable_maps_to_payment_required() {
        let err = LedgerError::OverageUnavailable {
            shop: ShopDomain::parse("x.myshopify.com").unwrap(),
            reason: "no billing method on file".to_string(),
        };
        let api_err: ApiError = err.into();
        assert!(matches!(api_err, ApiError::PaymentRequired(_)));
        assert!(api_err.to_string().contains("Add a payment method"));
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err = LedgerError::InvalidAdjustment {
            reason: "quantity must be positive".to_string(),
        };
        let api_err: ApiError = err.into();
        assert!(matches!(api_err, ApiError::BadRequest(_)));
    }
}
