#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Bizpilot shared crate
//!
//! Database pool helpers, embedded migrations and the subscription enums
//! shared by the API server, the billing crate and the worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DbError};
pub use types::{SubscriptionStatus, SubscriptionTier};
