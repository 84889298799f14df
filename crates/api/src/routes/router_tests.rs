//! Router integration tests against the in-memory store and mock gateway.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use time::OffsetDateTime;
use tower::ServiceExt;

use vesti_ledger::coupons::CouponCatalog;
use vesti_ledger::overage::test::MockBillingGateway;
use vesti_ledger::store::{LedgerStore, MemoryLedgerStore};
use vesti_ledger::LedgerService;

use crate::config::Config;
use crate::routes::{create_router, webhooks};
use crate::state::AppState;

const SHOP: &str = "router-test.myshopify.com";
const WEBHOOK_SECRET: &str = "whsec_router_test";

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: "postgres://localhost/unused".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        allowed_origins: "http://localhost:3000".to_string(),
    }
}

fn test_router(gateway: MockBillingGateway) -> Router {
    let store = Arc::new(MemoryLedgerStore::new());
    let catalog = CouponCatalog::with_codes([("WELCOME50".to_string(), 50)]);
    let ledger = LedgerService::new(
        store as Arc<dyn LedgerStore>,
        Arc::new(gateway),
        catalog,
    );

    // connect_lazy never touches the database; handlers here only use the
    // in-memory ledger.
    let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap();
    let state = AppState::with_ledger(pool, test_config(), Arc::new(ledger));
    create_router(state)
}

async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_account(router: &Router) {
    let (status, _) = send_json(
        router,
        "POST",
        "/v1/accounts",
        serde_json::json!({ "shop_domain": SHOP, "plan": "growth" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_install_then_consume_then_query() {
    let router = test_router(MockBillingGateway::without_billing_method());
    create_account(&router).await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/v1/credits/consume",
        serde_json::json!({
            "shop_domain": SHOP,
            "quantity": 7,
            "idempotency_key": "req_1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trial_used"], 7);
    assert_eq!(body["overage_billed"], 0);

    let (status, body) = send_json(
        &router,
        "GET",
        &format!("/v1/credits/balances/{SHOP}"),
        serde_json::Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trial"], 93);
    assert_eq!(body["total"], 93);
    assert_eq!(body["trial_active"], true);
}

#[tokio::test]
async fn test_consume_replay_via_http() {
    let router = test_router(MockBillingGateway::without_billing_method());
    create_account(&router).await;

    let request = serde_json::json!({
        "shop_domain": SHOP,
        "quantity": 5,
        "idempotency_key": "req_dup",
    });
    let (_, first) = send_json(&router, "POST", "/v1/credits/consume", request.clone()).await;
    let (_, replay) = send_json(&router, "POST", "/v1/credits/consume", request).await;

    assert_eq!(first["replayed"], false);
    assert_eq!(replay["replayed"], true);
    assert_eq!(first["trial_used"], replay["trial_used"]);
}

#[tokio::test]
async fn test_blocked_overage_returns_402_with_actionable_message() {
    let router = test_router(MockBillingGateway::without_billing_method());
    create_account(&router).await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/v1/credits/consume",
        serde_json::json!({
            "shop_domain": SHOP,
            "quantity": 500,
            "idempotency_key": "req_big",
        }),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("Add a payment method"), "got: {message}");
}

#[tokio::test]
async fn test_coupon_and_purchase_endpoints() {
    let router = test_router(MockBillingGateway::without_billing_method());
    create_account(&router).await;

    let (status, body) = send_json(
        &router,
        "POST",
        "/v1/credits/coupons/redeem",
        serde_json::json!({
            "shop_domain": SHOP,
            "coupon_code": "WELCOME50",
            "transaction_id": "txn_r1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["credited"], 50);
    assert_eq!(body["coupon"], 50);

    let (status, body) = send_json(
        &router,
        "POST",
        "/v1/credits/purchases/confirm",
        serde_json::json!({
            "shop_domain": SHOP,
            "package_id": "pack_200",
            "credit_amount": 200,
            "transaction_id": "txn_b1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["purchased"], 200);

    // Replays are success-no-ops.
    let (status, body) = send_json(
        &router,
        "POST",
        "/v1/credits/purchases/confirm",
        serde_json::json!({
            "shop_domain": SHOP,
            "package_id": "pack_200",
            "credit_amount": 200,
            "transaction_id": "txn_b1",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_applied"], true);
    assert_eq!(body["purchased"], 200);
}

#[tokio::test]
async fn test_webhook_applies_then_dedupes() {
    let router = test_router(MockBillingGateway::without_billing_method());
    create_account(&router).await;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let payload = serde_json::json!({
        "shop_domain": SHOP,
        "period_id": "gid://billing/period/1",
        "included_credits": 100,
        "period_start": now,
        "period_end": now + 30 * 86_400,
    })
    .to_string();
    let signature = webhooks::sign_payload(&payload, WEBHOOK_SECRET, now);

    let send = |payload: String, signature: String| {
        let router = router.clone();
        async move {
            let response = router
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/v1/webhooks/billing-period")
                        .header("content-type", "application/json")
                        .header(webhooks::SIGNATURE_HEADER, signature)
                        .body(Body::from(payload))
                        .unwrap(),
                )
                .await
                .unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            (status, json)
        }
    };

    let (status, body) = send(payload.clone(), signature.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");

    let (status, body) = send(payload, signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    let (_, balances) = send_json(
        &router,
        "GET",
        &format!("/v1/credits/balances/{SHOP}"),
        serde_json::Value::Null,
    )
    .await;
    assert_eq!(balances["plan"], 100);
}

#[tokio::test]
async fn test_unsigned_webhook_rejected() {
    let router = test_router(MockBillingGateway::without_billing_method());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/webhooks/billing-period")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_shop_domain_rejected() {
    let router = test_router(MockBillingGateway::without_billing_method());

    let (status, _) = send_json(
        &router,
        "POST",
        "/v1/credits/consume",
        serde_json::json!({
            "shop_domain": "not a shop/path",
            "quantity": 1,
            "idempotency_key": "req_bad",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
