//! Storage port for billing state
//!
//! Each mutating method is one unit of work: the primary row and its
//! `profiles` mirror are written together or not at all. Activity logging is
//! separate because it is best-effort.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use bizpilot_shared::SubscriptionStatus;

use crate::error::BillingResult;

pub const ACTION_SUBSCRIPTION_CREATED: &str = "subscription.created";
pub const ACTION_SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
pub const ACTION_PAYMENT_FAILED: &str = "payment.failed";

pub const METRIC_REVENUE: &str = "revenue";

/// Ledger states for `stripe_webhook_events.processing_result`
pub const RESULT_PROCESSING: &str = "processing";
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
/// A newer event already moved the subscription on; nothing was written
pub const RESULT_SUPERSEDED: &str = "superseded";
/// Terminal: failed [`MAX_PROCESSING_ATTEMPTS`] times and is no longer replayed
pub const RESULT_FAILED_PERMANENTLY: &str = "failed_permanently";

/// Processing attempts (deliveries and replays) before an event is given up
pub const MAX_PROCESSING_ATTEMPTS: i32 = 5;

/// A ledger row stuck in `processing` longer than this may be re-claimed
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Request to claim exclusive processing rights for an event id
#[derive(Debug, Clone)]
pub struct EventClaim<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub event_timestamp: OffsetDateTime,
    pub payload: &'a serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns processing of the event; `attempt` counts from 1
    Claimed { attempt: i32 },
    /// Processed successfully, or superseded, before
    AlreadyProcessed,
    /// Another delivery is processing it right now
    InProgress,
    /// Given up after repeated failures
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    Superseded,
    Error(String),
    /// Failed on the last allowed attempt
    GaveUp(String),
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Success => RESULT_SUCCESS,
            ProcessingResult::Superseded => RESULT_SUPERSEDED,
            ProcessingResult::Error(_) => RESULT_ERROR,
            ProcessingResult::GaveUp(_) => RESULT_FAILED_PERMANENTLY,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProcessingResult::Success | ProcessingResult::Superseded => None,
            ProcessingResult::Error(msg) | ProcessingResult::GaveUp(msg) => Some(msg),
        }
    }
}

/// Whether a subscription row last written at `last_applied` is newer than
/// an event created at `event_at`. Equal times apply; Stripe timestamps are
/// whole seconds.
pub fn is_superseded(last_applied: Option<OffsetDateTime>, event_at: OffsetDateTime) -> bool {
    last_applied.is_some_and(|last| last > event_at)
}

/// Result of an ordered subscription write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The row already reflects a newer Stripe event; nothing was written
    Stale,
}

/// Ledger row as loaded for replay
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Outcome of resolving a Stripe customer to the owning user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerLookup {
    Found(Uuid),
    NotFound,
    /// More than one subscription row claims the customer
    Ambiguous(usize),
}

/// Checkout completed: subscription upsert plus profile activation
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionActivation {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub event_at: OffsetDateTime,
}

/// Subscription created/updated: status and period copy plus profile status
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSync {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub event_at: OffsetDateTime,
}

/// Subscription deleted: canceled status plus profile downgrade to free
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionCancellation {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub cancelled_at: OffsetDateTime,
    pub event_at: OffsetDateTime,
}

/// Invoice payment failed: past-due status plus profile status
#[derive(Debug, Clone, PartialEq)]
pub struct PastDueMark {
    pub user_id: Uuid,
    pub event_at: OffsetDateTime,
}

/// One `metrics` revenue row
#[derive(Debug, Clone, PartialEq)]
pub struct RevenueEntry {
    pub user_id: Uuid,
    pub amount: f64,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// One `activity_logs` row
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub user_id: Uuid,
    pub action: &'static str,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Atomically claim an event id, re-claiming `error` rows and rows stuck
    /// in `processing` past [`PROCESSING_TIMEOUT_MINUTES`]
    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<ClaimOutcome>;

    /// Record the processing result of a claimed event
    async fn finish_event(&self, event_id: &str, result: &ProcessingResult) -> BillingResult<()>;

    async fn load_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>>;

    /// Events in `error`, least recently attempted first
    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>>;

    async fn find_user_by_customer(&self, stripe_customer_id: &str)
        -> BillingResult<CustomerLookup>;

    // Subscription writes carry the Stripe event time. A row last written by a
    // newer event is left alone and the write reports `Stale`.

    async fn activate_subscription(&self, activation: &SubscriptionActivation)
        -> BillingResult<WriteOutcome>;

    async fn sync_subscription(&self, sync: &SubscriptionSync) -> BillingResult<WriteOutcome>;

    async fn cancel_subscription(&self, cancellation: &SubscriptionCancellation)
        -> BillingResult<WriteOutcome>;

    /// Set the user's subscription and profile status to `past_due`
    async fn mark_past_due(&self, mark: &PastDueMark) -> BillingResult<WriteOutcome>;

    async fn record_revenue(&self, entry: &RevenueEntry) -> BillingResult<()>;

    async fn log_activity(&self, entry: &ActivityEntry) -> BillingResult<()>;
}
