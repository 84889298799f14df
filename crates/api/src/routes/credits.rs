//! Credit ledger endpoints: consumption, balances, coupons, purchases, and
//! account installation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use vesti_ledger::model::{BalanceSummary, LedgerAdjustment, TrialEndReason};
use vesti_shared::{PlanTier, ShopDomain};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_shop(raw: &str) -> ApiResult<ShopDomain> {
    ShopDomain::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// =============================================================================
// Account installation
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub shop_domain: String,
    pub plan: PlanTier,
}

/// `POST /v1/accounts` - create the ledger at install time. Idempotent; the
/// trial starts here with its fixed allotment.
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<BalanceSummary>)> {
    let shop = parse_shop(&request.shop_domain)?;
    let balances = state
        .ledger
        .install_account(&shop, request.plan, OffsetDateTime::now_utc())
        .await?;

    Ok((StatusCode::CREATED, Json(balances)))
}

// =============================================================================
// Consumption
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub shop_domain: String,
    pub quantity: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub trial_used: i64,
    pub coupon_used: i64,
    pub plan_used: i64,
    pub purchased_used: i64,
    pub overage_billed: i64,
    pub overage_amount_cents: i64,
    pub replayed: bool,
}

/// `POST /v1/credits/consume` - spend credits for one generation. Buckets
/// drain in fixed priority order; any shortfall is billed as overage. The
/// only failure is 402 when overage billing is unavailable.
pub async fn consume(
    State(state): State<AppState>,
    Json(request): Json<ConsumeRequest>,
) -> ApiResult<Json<ConsumeResponse>> {
    let shop = parse_shop(&request.shop_domain)?;
    let result = state
        .ledger
        .consumption
        .consume(
            &shop,
            request.quantity,
            &request.idempotency_key,
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(ConsumeResponse {
        trial_used: result.breakdown.trial,
        coupon_used: result.breakdown.coupon,
        plan_used: result.breakdown.plan,
        purchased_used: result.breakdown.purchased,
        overage_billed: result.overage.map_or(0, |o| o.units),
        overage_amount_cents: result.overage.map_or(0, |o| o.amount_cents),
        replayed: result.replayed,
    }))
}

// =============================================================================
// Balances & history
// =============================================================================

/// `GET /v1/credits/balances/{shop_domain}` - read-only balance view for the
/// dashboard. Reconciles lazy trial expiry on access.
pub async fn balances(
    State(state): State<AppState>,
    Path(shop_domain): Path<String>,
) -> ApiResult<Json<BalanceSummary>> {
    let shop = parse_shop(&shop_domain)?;
    let balances = state
        .ledger
        .balances(&shop, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(balances))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// `GET /v1/credits/history/{shop_domain}` - recent ledger adjustments,
/// newest first.
pub async fn history(
    State(state): State<AppState>,
    Path(shop_domain): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<LedgerAdjustment>>> {
    let shop = parse_shop(&shop_domain)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let entries = state.ledger.history(&shop, limit).await?;
    Ok(Json(entries))
}

// =============================================================================
// Trial
// =============================================================================

/// `POST /v1/accounts/{shop_domain}/trial/end` - explicit administrative
/// "trial consumed" signal. The trial bucket balance is untouched.
pub async fn end_trial(
    State(state): State<AppState>,
    Path(shop_domain): Path<String>,
) -> ApiResult<Json<BalanceSummary>> {
    let shop = parse_shop(&shop_domain)?;
    let now = OffsetDateTime::now_utc();
    state
        .ledger
        .trial
        .end_trial(&shop, TrialEndReason::Consumed, now)
        .await?;

    let balances = state.ledger.balances(&shop, now).await?;
    Ok(Json(balances))
}

// =============================================================================
// Coupons & purchases
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RedeemCouponRequest {
    pub shop_domain: String,
    pub coupon_code: String,
    pub transaction_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreditAddedResponse {
    pub credited: i64,
    pub already_applied: bool,
    #[serde(flatten)]
    pub balances: BalanceSummary,
}

/// `POST /v1/credits/coupons/redeem` - redeem a catalog coupon into the
/// coupon bucket. Idempotent per account and code.
pub async fn redeem_coupon(
    State(state): State<AppState>,
    Json(request): Json<RedeemCouponRequest>,
) -> ApiResult<Json<CreditAddedResponse>> {
    let shop = parse_shop(&request.shop_domain)?;
    let result = state
        .ledger
        .coupons
        .redeem(
            &shop,
            &request.coupon_code,
            &request.transaction_id,
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(CreditAddedResponse {
        credited: result.credited,
        already_applied: result.already_redeemed,
        balances: result.balances,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPurchaseRequest {
    pub shop_domain: String,
    pub package_id: String,
    pub credit_amount: i64,
    pub transaction_id: String,
}

/// `POST /v1/credits/purchases/confirm` - apply a confirmed credit-pack
/// purchase. Idempotent on the purchase transaction id.
pub async fn confirm_purchase(
    State(state): State<AppState>,
    Json(request): Json<ConfirmPurchaseRequest>,
) -> ApiResult<Json<CreditAddedResponse>> {
    let shop = parse_shop(&request.shop_domain)?;
    let result = state
        .ledger
        .purchases
        .confirm(
            &shop,
            &request.package_id,
            request.credit_amount,
            &request.transaction_id,
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(CreditAddedResponse {
        credited: result.credited,
        already_applied: result.already_applied,
        balances: result.balances,
    }))
}
