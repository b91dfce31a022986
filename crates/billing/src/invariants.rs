//! Billing invariants
//!
//! Read-only consistency checks over the subscription tables and the webhook
//! ledger. Safe to run at any time, including right after a replay.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{PROCESSING_TIMEOUT_MINUTES, RESULT_PROCESSING};

pub const CHECK_SINGLE_SUBSCRIPTION_PER_CUSTOMER: &str = "single_subscription_per_customer";
pub const CHECK_PROFILE_STATUS_MATCHES_SUBSCRIPTION: &str = "profile_status_matches_subscription";
pub const CHECK_CANCELED_PROFILE_IS_FREE: &str = "canceled_profile_is_free";
pub const CHECK_WEBHOOK_NOT_STUCK: &str = "webhook_not_stuck";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected, empty for ledger-level violations
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Webhooks for this customer cannot be routed
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SharedCustomerRow {
    stripe_customer_id: String,
    user_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    user_id: Uuid,
    subscription_status: String,
    profile_status: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledPaidRow {
    user_id: Uuid,
    subscription_tier: String,
    cancelled_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_subscription_per_customer().await?);
        violations.extend(self.check_profile_status_matches_subscription().await?);
        violations.extend(self.check_canceled_profile_is_free().await?);
        violations.extend(self.check_webhook_not_stuck().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// A Stripe customer owned by several rows cannot be resolved to a user,
    /// so every webhook for it is dropped.
    async fn check_single_subscription_per_customer(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedCustomerRow> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, ARRAY_AGG(user_id ORDER BY user_id) AS user_ids
            FROM subscriptions
            WHERE stripe_customer_id IS NOT NULL
            GROUP BY stripe_customer_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CHECK_SINGLE_SUBSCRIPTION_PER_CUSTOMER.to_string(),
                description: format!(
                    "Stripe customer {} is shared by {} subscription rows",
                    row.stripe_customer_id,
                    row.user_ids.len()
                ),
                context: serde_json::json!({
                    "stripe_customer_id": row.stripe_customer_id,
                    "row_count": row.user_ids.len(),
                }),
                user_ids: row.user_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// The profile mirror must carry the subscription's status
    async fn check_profile_status_matches_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.status AS subscription_status,
                   p.subscription_status AS profile_status
            FROM subscriptions s
            JOIN profiles p ON p.id = s.user_id
            WHERE p.subscription_status IS DISTINCT FROM s.status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CHECK_PROFILE_STATUS_MATCHES_SUBSCRIPTION.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Profile status {:?} differs from subscription status '{}'",
                    row.profile_status, row.subscription_status
                ),
                context: serde_json::json!({
                    "subscription_status": row.subscription_status,
                    "profile_status": row.profile_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Cancellation downgrades the profile to the free tier
    async fn check_canceled_profile_is_free(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledPaidRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, p.subscription_tier, s.cancelled_at
            FROM subscriptions s
            JOIN profiles p ON p.id = s.user_id
            WHERE s.status = 'canceled'
              AND p.subscription_tier <> 'free'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CHECK_CANCELED_PROFILE_IS_FREE.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Canceled subscription still grants paid tier '{}'",
                    row.subscription_tier
                ),
                context: serde_json::json!({
                    "subscription_tier": row.subscription_tier,
                    "cancelled_at": row.cancelled_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Ledger rows left in `processing` past the re-claim timeout
    async fn check_webhook_not_stuck(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result = $1
              AND processing_started_at < NOW() - make_interval(mins => $2)
            ORDER BY processing_started_at ASC
            "#,
        )
        .bind(RESULT_PROCESSING)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CHECK_WEBHOOK_NOT_STUCK.to_string(),
                user_ids: Vec::new(),
                description: format!(
                    "Webhook event {} ({}) stuck in processing",
                    row.stripe_event_id, row.event_type
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            CHECK_SINGLE_SUBSCRIPTION_PER_CUSTOMER => {
                self.check_single_subscription_per_customer().await
            }
            CHECK_PROFILE_STATUS_MATCHES_SUBSCRIPTION => {
                self.check_profile_status_matches_subscription().await
            }
            CHECK_CANCELED_PROFILE_IS_FREE => self.check_canceled_profile_is_free().await,
            CHECK_WEBHOOK_NOT_STUCK => self.check_webhook_not_stuck().await,
            _ => Err(BillingError::NotFound(format!(
                "Unknown invariant check: {}",
                name
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            CHECK_SINGLE_SUBSCRIPTION_PER_CUSTOMER,
            CHECK_PROFILE_STATUS_MATCHES_SUBSCRIPTION,
            CHECK_CANCELED_PROFILE_IS_FREE,
            CHECK_WEBHOOK_NOT_STUCK,
        ]
    }
}
