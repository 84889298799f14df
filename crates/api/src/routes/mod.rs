//! HTTP route definitions.

pub mod credits;
pub mod webhooks;

#[cfg(test)]
mod router_tests;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/accounts", post(credits::create_account))
        .route("/v1/accounts/{shop_domain}/trial/end", post(credits::end_trial))
        .route("/v1/credits/consume", post(credits::consume))
        .route("/v1/credits/balances/{shop_domain}", get(credits::balances))
        .route("/v1/credits/history/{shop_domain}", get(credits::history))
        .route("/v1/credits/coupons/redeem", post(credits::redeem_coupon))
        .route("/v1/credits/purchases/confirm", post(credits::confirm_purchase))
        .route("/v1/webhooks/billing-period", post(webhooks::billing_period))
        .with_state(state)
}

/// Liveness probe.
async fn health() -> &'static str {
    "ok"
}
