//! Stripe webhook handling
//!
//! Verifies deliveries, claims them in the idempotency ledger, and records
//! the billing state change each event kind implies. Stripe drives every
//! transition; nothing here initiates one.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::client::PaymentsGateway;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    opt_timestamp, parse_event, parse_event_value, BillingEvent, CheckoutSessionObject,
    InvoiceObject, SubscriptionObject, WebhookEvent,
};
use crate::plans::{plan_display_name, DEFAULT_PLAN_ID};
use crate::signature::WebhookVerifier;
use crate::store::{
    ActivityEntry, BillingStore, ClaimOutcome, CustomerLookup, EventClaim, PastDueMark,
    ProcessingResult, RevenueEntry, SubscriptionActivation, SubscriptionCancellation,
    SubscriptionSync, WriteOutcome, ACTION_PAYMENT_FAILED, ACTION_SUBSCRIPTION_CANCELED,
    ACTION_SUBSCRIPTION_CREATED, MAX_PROCESSING_ATTEMPTS, RESULT_ERROR, RESULT_SUCCESS,
    RESULT_SUPERSEDED,
};

/// Cancellation reason recorded when Stripe does not supply one
const DEFAULT_CANCELLATION_REASON: &str = "user_initiated";

/// Why an event was acknowledged without any write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Checkout metadata carried no usable `userId`
    MissingUserId,
    /// No single subscription row owns the Stripe customer
    UnknownCustomer,
}

/// Result of handling one delivery; every variant is acknowledged with 200
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum WebhookOutcome {
    Processed,
    Dropped(DropReason),
    /// Event id already processed, being processed, or given up on
    Duplicate,
    /// A newer event already updated the subscription; nothing was written
    Superseded,
    /// Event type has no handler
    Ignored,
}

/// Result of replaying a stored webhook event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    store: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentsGateway>,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        store: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentsGateway>,
    ) -> Self {
        Self {
            verifier,
            store,
            payments,
        }
    }

    /// Verify the signature over the raw body, then parse the envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            tracing::warn!(
                payload_len = payload.len(),
                error = %e,
                "Webhook signature verification failed"
            );
            return Err(e);
        }

        let event = parse_event(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            e
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified event exactly once per event id
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let claim = EventClaim {
            event_id: &event.id,
            event_type: &event.event_type,
            event_timestamp: event.created,
            payload: &event.payload,
        };

        let attempt = match self.store.claim_event(&claim).await? {
            ClaimOutcome::Claimed { attempt } => attempt,
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event - already processed successfully"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            ClaimOutcome::InProgress => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event - currently being processed by another delivery"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            ClaimOutcome::Abandoned => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event was given up after repeated failures - not processing"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = attempt,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let processing_result = match &result {
            Ok(WebhookOutcome::Superseded) => ProcessingResult::Superseded,
            Ok(_) => ProcessingResult::Success,
            Err(e) if attempt >= MAX_PROCESSING_ATTEMPTS => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts = attempt,
                    error = %e,
                    "Webhook event failed on its last allowed attempt - giving up"
                );
                ProcessingResult::GaveUp(e.to_string())
            }
            Err(e) => ProcessingResult::Error(e.to_string()),
        };
        self.finish_event(&event.id, &processing_result).await;

        result
    }

    /// Record the ledger result; failures are logged, never surfaced
    async fn finish_event(&self, event_id: &str, result: &ProcessingResult) {
        let strategy = ExponentialBackoff::from_millis(10)
            .factor(5)
            .map(jitter)
            .take(2);

        let outcome = Retry::spawn(strategy, || self.store.finish_event(event_id, result)).await;

        if let Err(e) = outcome {
            tracing::error!(
                event_id = %event_id,
                processing_result = %result.as_str(),
                error_message = ?result.error_message(),
                error = %e,
                "CRITICAL: Failed to update webhook ledger after retries. \
                 Event may appear stuck in 'processing' until the timeout elapses."
            );
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_at = event.created;
        let outcome = match &event.kind {
            BillingEvent::CheckoutCompleted(session) => {
                self.handle_checkout_completed(session, event_at).await?
            }
            BillingEvent::SubscriptionCreated(subscription)
            | BillingEvent::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(subscription, event_at).await?
            }
            BillingEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription, event_at).await?
            }
            BillingEvent::InvoicePaymentSucceeded(invoice) => {
                self.handle_invoice_payment_succeeded(invoice).await?
            }
            BillingEvent::InvoicePaymentFailed(invoice) => {
                self.handle_invoice_payment_failed(invoice, event_at).await?
            }
            BillingEvent::Unhandled { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                WebhookOutcome::Ignored
            }
        };

        Ok(outcome)
    }

    async fn handle_checkout_completed(
        &self,
        session: &CheckoutSessionObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(raw_user_id) = session.metadata_value("userId") else {
            tracing::warn!(session_id = %session.id, "No userId in checkout session metadata");
            return Ok(WebhookOutcome::Dropped(DropReason::MissingUserId));
        };

        let user_id = match Uuid::parse_str(raw_user_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    user_id = %raw_user_id,
                    error = %e,
                    "Checkout session metadata userId is not a UUID"
                );
                return Ok(WebhookOutcome::Dropped(DropReason::MissingUserId));
            }
        };

        // Re-fetch rather than trusting nested objects in the delivery
        let details = self.payments.retrieve_checkout(&session.id).await?;

        let stripe_customer_id = details
            .customer_id
            .clone()
            .or_else(|| session.customer.as_ref().map(|c| c.id().to_string()))
            .ok_or(BillingError::MissingField("customer"))?;
        let stripe_subscription_id = details
            .subscription_id
            .clone()
            .or_else(|| session.subscription.as_ref().map(|s| s.id().to_string()))
            .ok_or(BillingError::MissingField("subscription"))?;

        let plan_id = session
            .metadata_value("planId")
            .unwrap_or(DEFAULT_PLAN_ID)
            .to_string();
        let plan_name = session
            .metadata_value("planName")
            .map(str::to_string)
            .unwrap_or_else(|| plan_display_name(&plan_id).to_string());

        let activation = SubscriptionActivation {
            user_id,
            stripe_customer_id,
            stripe_subscription_id,
            plan_id: plan_id.clone(),
            plan_name,
            current_period_start: details.current_period_start,
            current_period_end: details.current_period_end,
            event_at,
        };

        let written = self
            .store
            .activate_subscription(&activation)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %user_id, error = %e, "Error activating subscription");
                e
            })?;
        if written == WriteOutcome::Stale {
            return Ok(superseded(user_id, &activation.stripe_subscription_id));
        }

        self.log_activity(ActivityEntry {
            user_id,
            action: ACTION_SUBSCRIPTION_CREATED,
            details: serde_json::json!({
                "plan": plan_id,
                "amount": session.amount_total.or(details.amount_total),
                "currency": session.currency.as_ref().or(details.currency.as_ref()),
            }),
        })
        .await;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            subscription_id = %activation.stripe_subscription_id,
            "Subscription activated"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_updated(
        &self,
        subscription: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = self.resolve_customer(subscription.customer.id()).await? else {
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };

        let (period_start, period_end) = subscription.period();
        let sync = SubscriptionSync {
            user_id,
            stripe_subscription_id: subscription.id.clone(),
            status: subscription.status,
            current_period_start: opt_timestamp(period_start)?,
            current_period_end: opt_timestamp(period_end)?,
            cancel_at: opt_timestamp(subscription.cancel_at)?,
            cancelled_at: opt_timestamp(subscription.canceled_at)?,
            event_at,
        };

        let written = self.store.sync_subscription(&sync).await.map_err(|e| {
            tracing::error!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                error = %e,
                "Error updating subscription"
            );
            e
        })?;
        if written == WriteOutcome::Stale {
            return Ok(superseded(user_id, &subscription.id));
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Subscription updated"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = self.resolve_customer(subscription.customer.id()).await? else {
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };

        let cancellation = SubscriptionCancellation {
            user_id,
            stripe_subscription_id: subscription.id.clone(),
            cancelled_at: OffsetDateTime::now_utc(),
            event_at,
        };

        let written = self
            .store
            .cancel_subscription(&cancellation)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Error canceling subscription"
                );
                e
            })?;
        if written == WriteOutcome::Stale {
            return Ok(superseded(user_id, &subscription.id));
        }

        let reason = subscription
            .cancellation_reason()
            .unwrap_or(DEFAULT_CANCELLATION_REASON);

        self.log_activity(ActivityEntry {
            user_id,
            action: ACTION_SUBSCRIPTION_CANCELED,
            details: serde_json::json!({ "reason": reason }),
        })
        .await;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            reason = %reason,
            "Subscription cancelled, downgraded to free tier"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_payment_succeeded(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<WebhookOutcome> {
        let Some(customer_id) = invoice.customer_id() else {
            tracing::warn!(invoice_id = %invoice.id, "No customer on invoice");
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };
        let Some(user_id) = self.resolve_customer(customer_id).await? else {
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };

        let now = OffsetDateTime::now_utc();
        let entry = RevenueEntry {
            user_id,
            amount: minor_to_major(invoice.amount_paid),
            period_start: opt_timestamp(invoice.period_start)?.unwrap_or(now),
            period_end: opt_timestamp(invoice.period_end)?.unwrap_or(now),
        };

        self.store.record_revenue(&entry).await?;

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_paid,
            "Invoice paid"
        );

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_payment_failed(
        &self,
        invoice: &InvoiceObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(customer_id) = invoice.customer_id() else {
            tracing::warn!(invoice_id = %invoice.id, "No customer on invoice");
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };
        let Some(user_id) = self.resolve_customer(customer_id).await? else {
            return Ok(WebhookOutcome::Dropped(DropReason::UnknownCustomer));
        };

        let mark = PastDueMark { user_id, event_at };
        if self.store.mark_past_due(&mark).await? == WriteOutcome::Stale {
            return Ok(superseded(user_id, &invoice.id));
        }

        self.log_activity(ActivityEntry {
            user_id,
            action: ACTION_PAYMENT_FAILED,
            details: serde_json::json!({
                "invoice_id": invoice.id,
                "amount": invoice.amount_due,
                "attempt": invoice.attempt_count,
            }),
        })
        .await;

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_due,
            attempt_count = invoice.attempt_count,
            "Invoice payment failed, subscription past due"
        );

        Ok(WebhookOutcome::Processed)
    }

    /// Resolve the owning user of a Stripe customer, `None` when the event
    /// must be dropped
    async fn resolve_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        match self.store.find_user_by_customer(customer_id).await? {
            CustomerLookup::Found(user_id) => Ok(Some(user_id)),
            CustomerLookup::NotFound => {
                tracing::warn!(customer_id = %customer_id, "Could not find user for customer");
                Ok(None)
            }
            CustomerLookup::Ambiguous(count) => {
                tracing::error!(
                    customer_id = %customer_id,
                    subscription_rows = count,
                    "Multiple subscription rows for customer, dropping event"
                );
                Ok(None)
            }
        }
    }

    async fn log_activity(&self, entry: ActivityEntry) {
        if let Err(e) = self.store.log_activity(&entry).await {
            tracing::warn!(
                user_id = %entry.user_id,
                action = %entry.action,
                error = %e,
                "Failed to write activity log"
            );
        }
    }

    // ============ WEBHOOK REPLAY ============

    /// Re-process one stored event by its Stripe event id
    pub async fn replay_event(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(stripe_event_id = %stripe_event_id, "Attempting to replay webhook event");

        let stored = self.store.load_event(stripe_event_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in ledger",
                stripe_event_id
            ))
        })?;

        let previous_status = stored.processing_result.clone();
        let previous_error = stored.error_message.clone();
        let event = parse_event_value(stored.payload)?;
        let event_type = event.event_type.clone();

        let handled = self.handle_event(event).await;

        // Report what the ledger recorded; it knows about superseded and given-up events
        let (new_status, new_error) = match self.store.load_event(stripe_event_id).await {
            Ok(Some(row)) => (row.processing_result, row.error_message),
            _ => match &handled {
                Ok(WebhookOutcome::Duplicate) => (previous_status.clone(), previous_error.clone()),
                Ok(WebhookOutcome::Superseded) => (RESULT_SUPERSEDED.to_string(), None),
                Ok(_) => (RESULT_SUCCESS.to_string(), None),
                Err(e) => (RESULT_ERROR.to_string(), Some(e.to_string())),
            },
        };

        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            stripe_event_id: stripe_event_id.to_string(),
            event_type,
            success: new_status == RESULT_SUCCESS || new_status == RESULT_SUPERSEDED,
            previous_status,
            previous_error,
            new_status,
            new_error,
        })
    }

    /// Replay failed events, least recently attempted first
    ///
    /// Each replay counts as an attempt; an event that keeps failing moves to
    /// `failed_permanently` and drops out of later batches.
    pub async fn replay_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self.store.failed_events(limit).await?;
        let mut results = Vec::with_capacity(failed.len());

        for stored in failed {
            match self.replay_event(&stored.stripe_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %stored.stripe_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        stripe_event_id: stored.stripe_event_id,
                        event_type: stored.event_type,
                        previous_status: stored.processing_result,
                        previous_error: stored.error_message,
                        new_status: RESULT_ERROR.to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}

fn superseded(user_id: Uuid, object_id: &str) -> WebhookOutcome {
    tracing::info!(
        user_id = %user_id,
        object_id = %object_id,
        "Subscription already updated by a newer event - skipping stale event"
    );
    WebhookOutcome::Superseded
}

/// Stripe amounts are integers in the currency's minor unit
fn minor_to_major(amount: i64) -> f64 {
    amount as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_to_major() {
        assert_eq!(minor_to_major(29_900), 299.0);
        assert_eq!(minor_to_major(1), 0.01);
        assert_eq!(minor_to_major(0), 0.0);
    }

    #[test]
    fn test_outcome_serializes_with_reason() {
        let json = serde_json::to_value(WebhookOutcome::Dropped(DropReason::UnknownCustomer))
            .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "outcome": "dropped", "reason": "unknown_customer" })
        );
    }
}
