// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Credit Ledger
//!
//! Exercises the full service against the in-memory store and mock billing
//! gateway:
//! - Priority consumption ordering and overage escalation
//! - Period renewal carry-forward and replay safety
//! - Trial expiry boundaries and post-trial spending
//! - Coupon/purchase idempotency
//! - Balance invariants under concurrent consumption

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use vesti_shared::{PlanTier, ShopDomain, TRIAL_ALLOTMENT};

use crate::coupons::CouponCatalog;
use crate::model::{AdjustmentReason, BucketKind};
use crate::overage::test::MockBillingGateway;
use crate::store::{LedgerStore, MemoryLedgerStore};
use crate::LedgerService;

fn shop() -> ShopDomain {
    ShopDomain::parse("edge-case.myshopify.com").unwrap()
}

fn t0() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(20_100)
}

/// Service over a fresh in-memory store, with the trial grant drained so
/// tests can shape balances explicitly.
async fn blank_service(gateway: MockBillingGateway) -> (LedgerService, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    store
        .create_account(&shop(), PlanTier::Growth, t0())
        .await
        .unwrap();
    store
        .adjust(
            &shop(),
            BucketKind::Trial,
            -TRIAL_ALLOTMENT,
            AdjustmentReason::Consumption,
            None,
            t0(),
        )
        .await
        .unwrap();

    let catalog = CouponCatalog::with_codes([("WELCOME50".to_string(), 50)]);
    let service = LedgerService::new(
        store.clone() as Arc<dyn LedgerStore>,
        Arc::new(gateway),
        catalog,
    );
    (service, store)
}

async fn set_balance(store: &MemoryLedgerStore, bucket: BucketKind, balance: i64) {
    if balance != 0 {
        store
            .adjust(
                &shop(),
                bucket,
                balance,
                AdjustmentReason::CreditPurchase,
                None,
                t0(),
            )
            .await
            .unwrap();
    }
}

mod priority_tests {
    use super::*;

    // =========================================================================
    // Given (trial=3, coupon=2, plan=5, purchased=10) a request for 7 drains
    // strictly left to right: trial and coupon to zero, plan partially,
    // purchased untouched.
    // =========================================================================
    #[tokio::test]
    async fn test_strict_left_to_right_draining() {
        let (service, store) = blank_service(MockBillingGateway::without_billing_method()).await;
        set_balance(&store, BucketKind::Trial, 3).await;
        set_balance(&store, BucketKind::Coupon, 2).await;
        set_balance(&store, BucketKind::Plan, 5).await;
        set_balance(&store, BucketKind::Purchased, 10).await;

        let result = service
            .consumption
            .consume(&shop(), 7, "prio_1", t0())
            .await
            .unwrap();

        assert_eq!(result.breakdown.trial, 3);
        assert_eq!(result.breakdown.coupon, 2);
        assert_eq!(result.breakdown.plan, 2);
        assert_eq!(result.breakdown.purchased, 0);
        assert!(result.overage.is_none());

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(
            (balances.trial, balances.coupon, balances.plan, balances.purchased),
            (0, 0, 3, 10)
        );
    }

    // =========================================================================
    // A trial-ended account still spends remaining trial balance first; the
    // inactive flag does not change drain order.
    // =========================================================================
    #[tokio::test]
    async fn test_ended_trial_balance_spends_first() {
        let (service, store) = blank_service(MockBillingGateway::without_billing_method()).await;
        set_balance(&store, BucketKind::Trial, 12).await;
        set_balance(&store, BucketKind::Coupon, 8).await;
        set_balance(&store, BucketKind::Plan, 8).await;

        service
            .trial
            .end_trial(&shop(), crate::model::TrialEndReason::Consumed, t0())
            .await
            .unwrap();

        let result = service
            .consumption
            .consume(&shop(), 5, "prio_2", t0())
            .await
            .unwrap();

        assert_eq!(result.breakdown.trial, 5);
        assert_eq!(result.breakdown.coupon, 0);
        assert_eq!(result.breakdown.plan, 0);

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.trial, 7);
        assert!(!balances.trial_active);
    }
}

mod overage_tests {
    use super::*;
    use crate::error::LedgerError;

    // =========================================================================
    // Request beyond the sum of all buckets: the shortfall, and exactly the
    // shortfall, is billed as overage.
    // =========================================================================
    #[tokio::test]
    async fn test_overage_bills_exactly_the_shortfall() {
        let gateway = MockBillingGateway::billable();
        let (service, store) = blank_service(gateway.clone()).await;
        set_balance(&store, BucketKind::Purchased, 1).await;

        let result = service
            .consumption
            .consume(&shop(), 5, "over_1", t0())
            .await
            .unwrap();

        assert_eq!(result.breakdown.purchased, 1);
        let overage = result.overage.unwrap();
        assert_eq!(overage.units, 4);
        assert_eq!(overage.amount_cents, 4 * PlanTier::Growth.overage_unit_rate_cents());

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.total, 0);

        let posted = gateway.posted_charges();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].1, 4);
    }

    // =========================================================================
    // Overage with a failed payment check must leave every balance unchanged
    // (no partial debit) and surface the only consume-path error.
    // =========================================================================
    #[tokio::test]
    async fn test_failed_payment_check_leaves_no_partial_debit() {
        let (service, store) = blank_service(MockBillingGateway::without_billing_method()).await;
        set_balance(&store, BucketKind::Trial, 2).await;
        set_balance(&store, BucketKind::Purchased, 1).await;

        let err = service
            .consumption
            .consume(&shop(), 10, "over_2", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::OverageUnavailable { .. }));

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.trial, 2);
        assert_eq!(balances.purchased, 1);
    }

    // =========================================================================
    // A charge that fails to post stays pending for the worker; the debit
    // itself is already committed.
    // =========================================================================
    #[tokio::test]
    async fn test_unposted_charge_stays_pending() {
        let gateway = MockBillingGateway::billable();
        gateway.set_fail_posts(true);
        let (service, store) = blank_service(gateway).await;

        service
            .consumption
            .consume(&shop(), 3, "over_3", t0())
            .await
            .unwrap();

        let pending = store.pending_overage_charges(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].units, 3);
    }
}

mod renewal_tests {
    use super::*;
    use crate::renewal::RenewalNotification;
    use crate::store::RenewalOutcome;

    fn notification(period_id: &str) -> RenewalNotification {
        RenewalNotification {
            period_id: period_id.to_string(),
            starts_at: t0(),
            ends_at: t0() + Duration::days(30),
            included_credits: Some(100),
        }
    }

    // =========================================================================
    // Renewal adds to the existing plan balance (20 + 100 = 120) and a
    // replayed period id leaves it at 120, not 220.
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_is_additive_and_replay_safe() {
        let (service, store) = blank_service(MockBillingGateway::without_billing_method()).await;
        set_balance(&store, BucketKind::Plan, 20).await;

        let first = service
            .renewal
            .on_period_renewed(&shop(), &notification("period_a"), t0())
            .await
            .unwrap();
        assert_eq!(first, RenewalOutcome::Applied { plan_balance: 120 });

        let replay = service
            .renewal
            .on_period_renewed(&shop(), &notification("period_a"), t0())
            .await
            .unwrap();
        assert_eq!(replay, RenewalOutcome::Duplicate);

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.plan, 120);
    }

    // =========================================================================
    // Concurrent delivery of the same notification (retried webhook racing a
    // live request) credits exactly once.
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_same_period_credits_once() {
        let (service, _) = blank_service(MockBillingGateway::without_billing_method()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .renewal
                    .on_period_renewed(&shop(), &notification("period_b"), t0())
                    .await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                RenewalOutcome::Applied { .. } => applied += 1,
                RenewalOutcome::Duplicate => {}
            }
        }
        assert_eq!(applied, 1);

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.plan, 100);
    }
}

mod trial_tests {
    use super::*;
    use crate::trial::{trial_status, TrialStatus};

    // =========================================================================
    // Lazy expiry on balance access: no timer, just the next read.
    // =========================================================================
    #[tokio::test]
    async fn test_balance_query_reconciles_trial() {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .create_account(&shop(), PlanTier::Starter, t0())
            .await
            .unwrap();
        let service = LedgerService::new(
            store.clone() as Arc<dyn LedgerStore>,
            Arc::new(MockBillingGateway::without_billing_method()),
            CouponCatalog::new(),
        );

        let balances = service
            .balances(&shop(), t0() + Duration::days(31))
            .await
            .unwrap();
        assert!(!balances.trial_active);
        // Balance carries over untouched.
        assert_eq!(balances.trial, TRIAL_ALLOTMENT);
    }

    // =========================================================================
    // Window boundary: 29d23h59m59s active, exactly 30d ended.
    // =========================================================================
    #[test]
    fn test_trial_window_boundary() {
        let state = crate::model::TrialState::Active { started_at: t0() };
        assert_eq!(
            trial_status(&state, t0() + Duration::days(30) - Duration::seconds(1)),
            TrialStatus::Active
        );
        assert_eq!(
            trial_status(&state, t0() + Duration::days(30)),
            TrialStatus::Ended
        );
    }
}

mod idempotency_tests {
    use super::*;

    // =========================================================================
    // Coupon: same transaction id twice credits exactly once.
    // =========================================================================
    #[tokio::test]
    async fn test_coupon_credits_exactly_once() {
        let (service, _) = blank_service(MockBillingGateway::without_billing_method()).await;

        service
            .coupons
            .redeem(&shop(), "WELCOME50", "txn_c1", t0())
            .await
            .unwrap();
        let replay = service
            .coupons
            .redeem(&shop(), "WELCOME50", "txn_c1", t0())
            .await
            .unwrap();

        assert!(replay.already_redeemed);
        assert_eq!(replay.balances.coupon, 50);
    }

    // =========================================================================
    // Purchase: same transaction id twice credits exactly once.
    // =========================================================================
    #[tokio::test]
    async fn test_purchase_credits_exactly_once() {
        let (service, _) = blank_service(MockBillingGateway::without_billing_method()).await;

        service
            .purchases
            .confirm(&shop(), "pack_200", 200, "txn_p1", t0())
            .await
            .unwrap();
        let replay = service
            .purchases
            .confirm(&shop(), "pack_200", 200, "txn_p1", t0())
            .await
            .unwrap();

        assert!(replay.already_applied);
        assert_eq!(replay.balances.purchased, 200);
    }

    // =========================================================================
    // Consume: replayed usage key returns the recorded breakdown and posts
    // no second charge.
    // =========================================================================
    #[tokio::test]
    async fn test_consume_replay_posts_no_second_charge() {
        let gateway = MockBillingGateway::billable();
        let (service, _) = blank_service(gateway.clone()).await;

        let first = service
            .consumption
            .consume(&shop(), 2, "txn_u1", t0())
            .await
            .unwrap();
        let replay = service
            .consumption
            .consume(&shop(), 2, "txn_u1", t0())
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(first.breakdown, replay.breakdown);
        assert_eq!(gateway.posted_charges().len(), 1);
    }
}

mod invariant_tests {
    use super::*;
    use tokio::sync::Barrier;

    // =========================================================================
    // Concurrent consumption never drives a balance negative and accounts
    // for every unit either from a bucket or as overage.
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_consumption_preserves_invariants() {
        let gateway = MockBillingGateway::billable();
        let (service, store) = blank_service(gateway).await;
        set_balance(&store, BucketKind::Plan, 5).await;

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = Vec::new();
        for i in 0..10 {
            let service = service.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service
                    .consumption
                    .consume(&shop(), 1, &format!("conc_{i}"), t0())
                    .await
            }));
        }

        let mut from_buckets = 0;
        let mut from_overage = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            from_buckets += result.breakdown.bucket_total();
            from_overage += result.breakdown.overage_units;
        }

        assert_eq!(from_buckets + from_overage, 10);
        assert_eq!(from_buckets, 5, "exactly the available credit was spent");

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.total, 0);
        assert!(balances.trial >= 0 && balances.coupon >= 0);
        assert!(balances.plan >= 0 && balances.purchased >= 0);
    }

    // =========================================================================
    // A mixed adjustment sequence keeps every bucket at or above zero; debits
    // past zero are rejected atomically.
    // =========================================================================
    #[tokio::test]
    async fn test_adjustment_sequence_never_goes_negative() {
        let (service, store) = blank_service(MockBillingGateway::without_billing_method()).await;

        let deltas: [(BucketKind, i64); 8] = [
            (BucketKind::Plan, 10),
            (BucketKind::Plan, -4),
            (BucketKind::Coupon, 3),
            (BucketKind::Coupon, -5),
            (BucketKind::Purchased, 7),
            (BucketKind::Purchased, -7),
            (BucketKind::Plan, -6),
            (BucketKind::Plan, -1),
        ];

        for (bucket, delta) in deltas {
            let result = store
                .adjust(
                    &shop(),
                    bucket,
                    delta,
                    AdjustmentReason::Consumption,
                    None,
                    t0(),
                )
                .await;

            let balances = service.balances(&shop(), t0()).await.unwrap();
            assert!(balances.trial >= 0);
            assert!(balances.coupon >= 0);
            assert!(balances.plan >= 0);
            assert!(balances.purchased >= 0);

            // Over-debits fail without clamping.
            if let Err(e) = result {
                assert!(matches!(
                    e,
                    crate::error::LedgerError::InsufficientBalance { .. }
                ));
            }
        }

        let balances = service.balances(&shop(), t0()).await.unwrap();
        assert_eq!(balances.plan, 0);
        assert_eq!(balances.coupon, 3);
        assert_eq!(balances.purchased, 0);
    }
}
