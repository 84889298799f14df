//! Vesti Background Worker
//!
//! Handles scheduled ledger maintenance:
//! - Re-posting pending overage charges to the platform (every 15 minutes)
//! - Trial-expiry sweep so dashboards see ended trials promptly (hourly)
//! - Applied idempotency-key retention purge (daily at 3:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use vesti_ledger::{LedgerService, LedgerStore};

/// How long applied idempotency keys are retained before purging. Replays
/// arrive within a short window of the original; 30 days is generous.
const KEY_RETENTION_DAYS: i64 = 30;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Re-post overage charges whose usage charge never reached the platform.
async fn repost_pending_charges(ledger: &LedgerService) {
    let pending = match ledger.store.pending_overage_charges(100).await {
        Ok(charges) => charges,
        Err(e) => {
            error!(error = %e, "Failed to load pending overage charges");
            return;
        }
    };

    if pending.is_empty() {
        return;
    }

    let total = pending.len();
    let mut posted = 0;
    let mut errors = 0;

    for charge in pending {
        match ledger.overage.post_charge(&charge).await {
            Ok(platform_charge_id) => {
                match ledger
                    .store
                    .mark_overage_posted(charge.id, &platform_charge_id, OffsetDateTime::now_utc())
                    .await
                {
                    Ok(()) => posted += 1,
                    Err(e) => {
                        error!(charge_id = %charge.id, error = %e, "Posted charge but failed to record it");
                        errors += 1;
                    }
                }
            }
            Err(e) => {
                warn!(
                    charge_id = %charge.id,
                    shop = %charge.shop,
                    amount_cents = charge.amount_cents,
                    error = %e,
                    "Overage charge still not posting"
                );
                errors += 1;
            }
        }
    }

    info!(
        total = total,
        posted = posted,
        errors = errors,
        "Pending overage re-post cycle complete"
    );
}

/// Flip trials whose 30-day window elapsed. Consumption already evaluates
/// expiry lazily; this sweep just keeps read models current between visits.
async fn sweep_expired_trials(ledger: &LedgerService) {
    let now = OffsetDateTime::now_utc();
    let expired = match ledger.store.expired_trials(now, 500).await {
        Ok(shops) => shops,
        Err(e) => {
            error!(error = %e, "Failed to list expired trials");
            return;
        }
    };

    if expired.is_empty() {
        return;
    }

    let total = expired.len();
    let mut ended = 0;

    for shop in expired {
        match ledger.trial.reconcile(&shop, now).await {
            Ok(_) => ended += 1,
            Err(e) => error!(shop = %shop, error = %e, "Failed to reconcile expired trial"),
        }
    }

    info!(total = total, ended = ended, "Trial expiry sweep complete");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Vesti Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create ledger service
    let ledger = match LedgerService::from_env(pool.clone()) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            // Without the platform billing API there is nothing to re-post;
            // run in minimal mode rather than crash-looping.
            warn!(error = %e, "Failed to create ledger service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Re-post pending overage charges (every 15 minutes)
    let repost_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let ledger = repost_ledger.clone();
            Box::pin(async move {
                info!("Running pending overage re-post job");
                repost_pending_charges(&ledger).await;
            })
        })?)
        .await?;
    info!("Scheduled: Pending overage re-post (every 15 minutes)");

    // Job 2: Trial expiry sweep (hourly)
    let trial_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let ledger = trial_ledger.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                sweep_expired_trials(&ledger).await;
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 3: Applied idempotency-key purge (daily at 3:00 AM UTC)
    let purge_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let ledger = purge_ledger.clone();
            Box::pin(async move {
                info!("Running applied-key retention purge");
                let cutoff = OffsetDateTime::now_utc() - time::Duration::days(KEY_RETENTION_DAYS);
                match ledger.store.purge_applied_keys(cutoff).await {
                    Ok(purged) => info!(purged = purged, "Applied-key purge complete"),
                    Err(e) => error!(error = %e, "Applied-key purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Applied-key purge (daily at 3:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Vesti Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
