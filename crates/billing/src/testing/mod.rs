//! In-memory doubles for the billing ports
//!
//! Compiled for this crate's tests and for dependents that enable the
//! `test-util` feature.

mod fixtures;
mod gateway;
mod memory;

pub use fixtures::{
    checkout_completed, event_body, event_body_at, invoice_payment_failed,
    invoice_payment_succeeded, signed, subscription_deleted, subscription_updated,
    TEST_WEBHOOK_SECRET,
};
pub use gateway::{checkout_details, StaticGateway};
pub use memory::{LedgerRow, MemoryStore, ProfileRow, StoreOp, SubscriptionRow};
