//! Trial lifecycle management.
//!
//! `NotStarted -> Active -> Ended`, with `Active -> Ended` triggered either
//! by the 30-day window elapsing (evaluated lazily on access, no background
//! timer required) or by an explicit administrative signal. Ending a trial
//! flips the state only: unused trial credit remains spendable afterward and
//! still drains at trial-first priority. That carry-over is documented
//! business policy, not an accident of the implementation.

use std::sync::Arc;

use time::OffsetDateTime;

use vesti_shared::{ShopDomain, TRIAL_DURATION};

use crate::error::{LedgerError, LedgerResult};
use crate::model::{TrialEndReason, TrialState};
use crate::store::LedgerStore;

/// Point-in-time trial status, computed without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialStatus {
    NotStarted,
    Active,
    Ended,
}

/// Evaluate a trial state against the clock. The single source of truth for
/// expiry; every call site evaluates on demand instead of scattering
/// wall-clock checks.
#[must_use]
pub fn trial_status(state: &TrialState, now: OffsetDateTime) -> TrialStatus {
    match state {
        TrialState::NotStarted => TrialStatus::NotStarted,
        TrialState::Active { started_at } => {
            if now - *started_at >= TRIAL_DURATION {
                TrialStatus::Ended
            } else {
                TrialStatus::Active
            }
        }
        TrialState::Ended { .. } => TrialStatus::Ended,
    }
}

/// Drives trial state transitions against the store.
#[derive(Clone)]
pub struct TrialLifecycleManager {
    store: Arc<dyn LedgerStore>,
}

impl TrialLifecycleManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Lazily persist an elapsed trial on access. Returns the current
    /// (possibly just-transitioned) state.
    pub async fn reconcile(
        &self,
        shop: &ShopDomain,
        now: OffsetDateTime,
    ) -> LedgerResult<TrialState> {
        let ledger = self
            .store
            .get_ledger(shop)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;

        match ledger.trial {
            TrialState::Active { started_at }
                if trial_status(&ledger.trial, now) == TrialStatus::Ended =>
            {
                // Pin the end to the window boundary, not the access time.
                let ended = TrialState::Ended {
                    started_at,
                    ended_at: started_at + TRIAL_DURATION,
                    reason: TrialEndReason::DurationElapsed,
                };
                self.store.set_trial_state(shop, ended, now).await?;
                tracing::info!(shop = %shop, "Trial window elapsed; trial marked ended");
                Ok(ended)
            }
            state => Ok(state),
        }
    }

    /// Explicit administrative "trial consumed" signal. Idempotent: an
    /// already-ended trial is returned unchanged.
    pub async fn end_trial(
        &self,
        shop: &ShopDomain,
        reason: TrialEndReason,
        now: OffsetDateTime,
    ) -> LedgerResult<TrialState> {
        let ledger = self
            .store
            .get_ledger(shop)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound { shop: shop.clone() })?;

        match ledger.trial {
            TrialState::Active { started_at } => {
                let ended = TrialState::Ended {
                    started_at,
                    ended_at: now,
                    reason,
                };
                self.store.set_trial_state(shop, ended, now).await?;
                tracing::info!(shop = %shop, reason = reason.as_str(), "Trial ended by signal");
                Ok(ended)
            }
            ended @ TrialState::Ended { .. } => Ok(ended),
            TrialState::NotStarted => Err(LedgerError::InvalidAdjustment {
                reason: "trial has not started".to_string(),
            }),
        }
    }
}
