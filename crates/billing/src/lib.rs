// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries Stripe error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Bizpilot Billing Module
//!
//! Keeps subscription state in sync with Stripe through its webhooks.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with a replay window
//! - **Idempotency Ledger**: Each Stripe event id is processed at most once
//! - **Subscription Lifecycle**: Checkout activation, status sync, cancellation
//! - **Revenue Metrics**: One revenue row per paid invoice
//! - **Replay**: Re-run failed events from their stored payloads
//! - **Invariants**: Read-only consistency checks over billing tables

pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod plans;
pub mod postgres;
pub mod signature;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


use std::sync::Arc;

use sqlx::PgPool;

// Client
pub use client::{CheckoutDetails, PaymentsGateway, StripeClient, StripeConfig, StripeGateway};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, WebhookEvent, HANDLED_EVENT_TYPES};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{has_feature_access, plan_display_name, Plan, PlanPricing};

// Storage
pub use postgres::PgBillingStore;
pub use store::BillingStore;

// Webhooks
pub use signature::{WebhookVerifier, DEFAULT_TOLERANCE_SECS};
pub use webhooks::{DropReason, WebhookHandler, WebhookOutcome, WebhookReplayResult};

/// Build a webhook handler wired to Postgres and the Stripe API
pub fn webhook_handler(
    config: StripeConfig,
    pool: PgPool,
    tolerance_secs: i64,
) -> WebhookHandler {
    let gateway = StripeGateway::new(StripeClient::new(&config));
    let verifier = WebhookVerifier::new(config.webhook_secret).with_tolerance(tolerance_secs);

    WebhookHandler::new(
        verifier,
        Arc::new(PgBillingStore::new(pool)),
        Arc::new(gateway),
    )
}
