//! Postgres implementation of [`BillingStore`]

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use bizpilot_shared::{SubscriptionStatus, SubscriptionTier};

use crate::error::{BillingError, BillingResult};
use crate::store::{
    is_superseded, ActivityEntry, BillingStore, ClaimOutcome, CustomerLookup, EventClaim,
    PastDueMark, ProcessingResult, RevenueEntry, StoredEvent, SubscriptionActivation,
    SubscriptionCancellation, SubscriptionSync, WriteOutcome, METRIC_REVENUE,
    PROCESSING_TIMEOUT_MINUTES, RESULT_ERROR, RESULT_FAILED_PERMANENTLY, RESULT_SUCCESS,
    RESULT_SUPERSEDED,
};

/// How a subscription row is located for the ordering check
enum SubscriptionKey<'a> {
    User(Uuid),
    StripeSubscription(&'a str),
}

/// Lock the subscription row and read the event time it last applied
async fn lock_last_event_at(
    conn: &mut PgConnection,
    key: SubscriptionKey<'_>,
) -> BillingResult<Option<OffsetDateTime>> {
    let row: Option<(Option<OffsetDateTime>,)> = match key {
        SubscriptionKey::User(user_id) => {
            sqlx::query_as("SELECT last_event_at FROM subscriptions WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?
        }
        SubscriptionKey::StripeSubscription(subscription_id) => {
            sqlx::query_as(
                "SELECT last_event_at FROM subscriptions \
                 WHERE stripe_subscription_id = $1 FOR UPDATE",
            )
            .bind(subscription_id)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    Ok(row.and_then(|(at,)| at))
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn claim_event(&self, claim: &EventClaim<'_>) -> BillingResult<ClaimOutcome> {
        // INSERT...ON CONFLICT...RETURNING gives exactly one concurrent caller the row.
        // Failed events are re-claimable so the sender's retry can reprocess them.
        let claimed: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, payload,
                 processing_result, processing_started_at, attempts)
            VALUES ($1, $2, $3, $4, 'processing', NOW(), 1)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                attempts = stripe_webhook_events.attempts + 1,
                payload = EXCLUDED.payload,
                error_message = CONCAT(
                    'Re-claimed from ', stripe_webhook_events.processing_result,
                    ' at ', NOW()::TEXT
                )
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $5))
            RETURNING attempts
            "#,
        )
        .bind(claim.event_id)
        .bind(claim.event_type)
        .bind(claim.event_timestamp)
        .bind(Json(claim.payload))
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %claim.event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if let Some((attempt,)) = claimed {
            return Ok(ClaimOutcome::Claimed { attempt });
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(claim.event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == RESULT_SUCCESS || status == RESULT_SUPERSEDED => {
                ClaimOutcome::AlreadyProcessed
            }
            Some((status,)) if status == RESULT_FAILED_PERMANENTLY => ClaimOutcome::Abandoned,
            _ => ClaimOutcome::InProgress,
        })
    }

    async fn finish_event(&self, event_id: &str, result: &ProcessingResult) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(result.error_message())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>> {
        let record: Option<StoredEvent> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_result, error_message,
                   attempts, payload, created_at
            FROM stripe_webhook_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn failed_events(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
        let records: Vec<StoredEvent> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_result, error_message,
                   attempts, payload, created_at
            FROM stripe_webhook_events
            WHERE processing_result = $1
            ORDER BY processing_started_at ASC NULLS FIRST, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(RESULT_ERROR)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_user_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<CustomerLookup> {
        // LIMIT 2 is enough to tell "exactly one" from "more than one"
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM subscriptions WHERE stripe_customer_id = $1 LIMIT 2",
        )
        .bind(stripe_customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(match rows.as_slice() {
            [] => CustomerLookup::NotFound,
            [(user_id,)] => CustomerLookup::Found(*user_id),
            many => CustomerLookup::Ambiguous(many.len()),
        })
    }

    async fn activate_subscription(
        &self,
        activation: &SubscriptionActivation,
    ) -> BillingResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;

        let last = lock_last_event_at(&mut tx, SubscriptionKey::User(activation.user_id)).await?;
        if is_superseded(last, activation.event_at) {
            return Ok(WriteOutcome::Stale);
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, stripe_customer_id, stripe_subscription_id, plan_id, plan_name,
                status, current_period_start, current_period_end, last_event_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                plan_id = EXCLUDED.plan_id,
                plan_name = EXCLUDED.plan_name,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at = NULL,
                cancelled_at = NULL,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            "#,
        )
        .bind(activation.user_id)
        .bind(&activation.stripe_customer_id)
        .bind(&activation.stripe_subscription_id)
        .bind(&activation.plan_id)
        .bind(&activation.plan_name)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(activation.current_period_start)
        .bind(activation.current_period_end)
        .bind(activation.event_at)
        .execute(&mut *tx)
        .await?;

        let profile = sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_tier = $1, subscription_status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(&activation.plan_id)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(activation.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if profile.rows_affected() == 0 {
            tracing::warn!(
                user_id = %activation.user_id,
                "No profile row to mirror subscription activation into"
            );
        }

        Ok(WriteOutcome::Applied)
    }

    async fn sync_subscription(&self, sync: &SubscriptionSync) -> BillingResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;

        let last = lock_last_event_at(
            &mut tx,
            SubscriptionKey::StripeSubscription(&sync.stripe_subscription_id),
        )
        .await?;
        if is_superseded(last, sync.event_at) {
            return Ok(WriteOutcome::Stale);
        }

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = $1,
                current_period_start = COALESCE($2, current_period_start),
                current_period_end = COALESCE($3, current_period_end),
                cancel_at = $4,
                cancelled_at = $5,
                last_event_at = $6,
                updated_at = NOW()
            WHERE stripe_subscription_id = $7
            "#,
        )
        .bind(sync.status.as_str())
        .bind(sync.current_period_start)
        .bind(sync.current_period_end)
        .bind(sync.cancel_at)
        .bind(sync.cancelled_at)
        .bind(sync.event_at)
        .bind(&sync.stripe_subscription_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE profiles SET subscription_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(sync.status.as_str())
        .bind(sync.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                user_id = %sync.user_id,
                subscription_id = %sync.stripe_subscription_id,
                "No subscription row matched the Stripe subscription id"
            );
        }

        Ok(WriteOutcome::Applied)
    }

    async fn cancel_subscription(
        &self,
        cancellation: &SubscriptionCancellation,
    ) -> BillingResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;

        let last = lock_last_event_at(
            &mut tx,
            SubscriptionKey::StripeSubscription(&cancellation.stripe_subscription_id),
        )
        .await?;
        if is_superseded(last, cancellation.event_at) {
            return Ok(WriteOutcome::Stale);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, cancelled_at = $2, last_event_at = $3, updated_at = NOW()
            WHERE stripe_subscription_id = $4
            "#,
        )
        .bind(SubscriptionStatus::Canceled.as_str())
        .bind(cancellation.cancelled_at)
        .bind(cancellation.event_at)
        .bind(&cancellation.stripe_subscription_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE profiles
            SET subscription_status = $1, subscription_tier = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(SubscriptionStatus::Canceled.as_str())
        .bind(SubscriptionTier::Free.as_str())
        .bind(cancellation.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(WriteOutcome::Applied)
    }

    async fn mark_past_due(&self, mark: &PastDueMark) -> BillingResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;

        let last = lock_last_event_at(&mut tx, SubscriptionKey::User(mark.user_id)).await?;
        if is_superseded(last, mark.event_at) {
            return Ok(WriteOutcome::Stale);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, last_event_at = $2, updated_at = NOW()
            WHERE user_id = $3
            "#,
        )
        .bind(SubscriptionStatus::PastDue.as_str())
        .bind(mark.event_at)
        .bind(mark.user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE profiles SET subscription_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(SubscriptionStatus::PastDue.as_str())
        .bind(mark.user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(WriteOutcome::Applied)
    }

    async fn record_revenue(&self, entry: &RevenueEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metrics (user_id, metric_type, metric_value, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.user_id)
        .bind(METRIC_REVENUE)
        .bind(entry.amount)
        .bind(entry.period_start)
        .bind(entry.period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_activity(&self, entry: &ActivityEntry) -> BillingResult<()> {
        sqlx::query("INSERT INTO activity_logs (user_id, action, details) VALUES ($1, $2, $3)")
            .bind(entry.user_id)
            .bind(entry.action)
            .bind(Json(&entry.details))
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
