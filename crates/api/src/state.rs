//! Application state.

use std::sync::Arc;

use sqlx::PgPool;

use vesti_ledger::LedgerService;

use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub ledger: Arc<LedgerService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let ledger = LedgerService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("failed to initialize ledger service: {e}"))?;
        tracing::info!("Ledger service initialized");

        Ok(Self {
            pool,
            config,
            ledger: Arc::new(ledger),
        })
    }

    /// Build state around an already-wired ledger service (tests use this
    /// with the in-memory store and mock gateway).
    pub fn with_ledger(pool: PgPool, config: Config, ledger: Arc<LedgerService>) -> Self {
        Self {
            pool,
            config,
            ledger,
        }
    }
}
