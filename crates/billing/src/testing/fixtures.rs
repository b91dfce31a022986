//! Stripe event payloads shaped like real deliveries

use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::signature::WebhookVerifier;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_bizpilot_secret";

/// Wrap a Stripe object in an event envelope created now
pub fn event_body(event_id: &str, event_type: &str, object: Value) -> Vec<u8> {
    event_body_at(
        event_id,
        event_type,
        object,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

/// Wrap a Stripe object in an event envelope with an explicit `created` time
pub fn event_body_at(event_id: &str, event_type: &str, object: Value, created: i64) -> Vec<u8> {
    let envelope = json!({
        "id": event_id,
        "object": "event",
        "api_version": "2024-06-20",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object },
    });
    envelope.to_string().into_bytes()
}

/// Sign `body` with the test secret at the current time
pub fn signed(body: &[u8]) -> BillingResult<String> {
    WebhookVerifier::new(TEST_WEBHOOK_SECRET).sign(body, OffsetDateTime::now_utc().unix_timestamp())
}

pub fn checkout_completed(session_id: &str, user_id: Option<Uuid>, plan_id: Option<&str>) -> Value {
    let mut metadata = serde_json::Map::new();
    if let Some(user_id) = user_id {
        metadata.insert("userId".to_string(), json!(user_id.to_string()));
    }
    if let Some(plan_id) = plan_id {
        metadata.insert("planId".to_string(), json!(plan_id));
    }

    json!({
        "id": session_id,
        "object": "checkout.session",
        "mode": "subscription",
        "amount_total": 29_900,
        "currency": "usd",
        "customer": "cus_checkout",
        "subscription": "sub_checkout",
        "metadata": metadata,
    })
}

pub fn subscription_updated(subscription_id: &str, customer_id: &str, status: &str) -> Value {
    json!({
        "id": subscription_id,
        "object": "subscription",
        "customer": customer_id,
        "status": status,
        "cancel_at": null,
        "canceled_at": null,
        "items": {
            "object": "list",
            "data": [{
                "id": "si_1",
                "current_period_start": 1_735_689_600,
                "current_period_end": 1_738_368_000,
            }],
        },
    })
}

pub fn subscription_deleted(
    subscription_id: &str,
    customer_id: &str,
    reason: Option<&str>,
) -> Value {
    json!({
        "id": subscription_id,
        "object": "subscription",
        "customer": customer_id,
        "status": "canceled",
        "canceled_at": 1_736_000_000,
        "cancellation_details": { "reason": reason },
    })
}

pub fn invoice_payment_succeeded(invoice_id: &str, customer_id: &str, amount_paid: i64) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": customer_id,
        "amount_paid": amount_paid,
        "amount_due": amount_paid,
        "attempt_count": 1,
        "currency": "usd",
        "period_start": 1_735_689_600,
        "period_end": 1_738_368_000,
    })
}

pub fn invoice_payment_failed(
    invoice_id: &str,
    customer_id: &str,
    amount_due: i64,
    attempt_count: i64,
) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": customer_id,
        "amount_paid": 0,
        "amount_due": amount_due,
        "attempt_count": attempt_count,
        "currency": "usd",
    })
}
