// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vesti Shared Library
//!
//! Types and helpers used by every Vesti crate: the normalized shop-domain
//! account identifier, subscription plan tiers with their credit allotments,
//! and database pool construction.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool};
pub use types::{
    PlanTier, PlanTierParseError, ShopDomain, ShopDomainError, TRIAL_ALLOTMENT, TRIAL_DURATION,
};
