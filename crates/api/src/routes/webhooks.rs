//! Billing webhook receiver.
//!
//! The platform delivers billing-period-change notifications signed with a
//! shared secret. Signature verification runs against the raw body before
//! any parsing, with a replay-protection timestamp tolerance. Processing is
//! idempotent on the period id, so redelivered or racing webhooks are safe.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;

use vesti_ledger::renewal::RenewalNotification;
use vesti_ledger::store::RenewalOutcome;
use vesti_shared::ShopDomain;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Signature header: `t=<unix-seconds>,v1=<hex hmac of "t.body">`.
pub const SIGNATURE_HEADER: &str = "x-vesti-signature";

/// Maximum accepted webhook age in seconds (replay protection).
const TIMESTAMP_TOLERANCE_SECONDS: i64 = 300;

#[derive(Debug, Deserialize)]
pub struct PeriodRenewalPayload {
    pub shop_domain: String,
    pub period_id: String,
    /// Included credits for the period; the plan tier allotment applies when
    /// omitted.
    pub included_credits: Option<i64>,
    /// Unix seconds.
    pub period_start: i64,
    /// Unix seconds.
    pub period_end: i64,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

/// `POST /v1/webhooks/billing-period` - apply a period renewal. Returns
/// `applied` or `duplicate`; both are 200 so the platform stops retrying.
pub async fn billing_period(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing webhook signature".to_string()))?;

    verify_signature(&body, signature, &state.config.webhook_secret)?;

    let payload: PeriodRenewalPayload = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {e}")))?;

    let shop = ShopDomain::parse(&payload.shop_domain)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let starts_at = OffsetDateTime::from_unix_timestamp(payload.period_start)
        .map_err(|e| ApiError::BadRequest(format!("invalid period_start: {e}")))?;
    let ends_at = OffsetDateTime::from_unix_timestamp(payload.period_end)
        .map_err(|e| ApiError::BadRequest(format!("invalid period_end: {e}")))?;

    let notification = RenewalNotification {
        period_id: payload.period_id,
        starts_at,
        ends_at,
        included_credits: payload.included_credits,
    };

    let outcome = state
        .ledger
        .renewal
        .on_period_renewed(&shop, &notification, OffsetDateTime::now_utc())
        .await?;

    let status = match outcome {
        RenewalOutcome::Applied { .. } => "applied",
        RenewalOutcome::Duplicate => "duplicate",
    };
    Ok(Json(WebhookResponse { status }))
}

/// Verify the `t=...,v1=...` signature header against the raw body.
///
/// The signed payload is `"{timestamp}.{body}"`; the timestamp must be
/// within tolerance of the current clock.
fn verify_signature(payload: &str, signature: &str, secret: &str) -> ApiResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| ApiError::Unauthorized("missing timestamp in signature".to_string()))?;
    let v1_signature = v1_signature
        .ok_or_else(|| ApiError::Unauthorized("missing v1 signature".to_string()))?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECONDS {
        tracing::warn!(
            timestamp = timestamp,
            age_seconds = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(ApiError::Unauthorized(
            "webhook timestamp expired".to_string(),
        ));
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Internal("invalid webhook secret".to_string()))?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(ApiError::Unauthorized(
            "invalid webhook signature".to_string(),
        ));
    }

    Ok(())
}

/// Build a signature header value for a payload (test helper, also used by
/// the platform simulator in local development).
#[must_use]
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let signed_payload = format!("{timestamp}.{payload}");
    #[allow(clippy::expect_used)] // HMAC accepts keys of any length
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(signed_payload.as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
