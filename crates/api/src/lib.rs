// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Vesti API Library
//!
//! HTTP surface for the credit ledger: consumption, balance queries, coupon
//! redemption, purchase confirmation, and the billing webhook receiver.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
