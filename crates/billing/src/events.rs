//! Stripe event envelope parsing
//!
//! Deliveries are parsed into [`WebhookEvent`], whose `kind` is a closed
//! [`BillingEvent`] sum type. Only the fields the handlers read are modelled;
//! everything else in the Stripe object is ignored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use bizpilot_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CUSTOMER_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Event types with a dedicated handler
pub const HANDLED_EVENT_TYPES: &[&str] = &[
    CHECKOUT_SESSION_COMPLETED,
    CUSTOMER_SUBSCRIPTION_CREATED,
    CUSTOMER_SUBSCRIPTION_UPDATED,
    CUSTOMER_SUBSCRIPTION_DELETED,
    INVOICE_PAYMENT_SUCCEEDED,
    INVOICE_PAYMENT_FAILED,
];

#[derive(Debug, Clone, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    #[serde(default)]
    livemode: bool,
    data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

/// A verified, parsed webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub livemode: bool,
    pub kind: BillingEvent,
    /// Original JSON, kept for the idempotency ledger and replay
    pub payload: serde_json::Value,
}

/// Every event kind the webhook reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaymentSucceeded(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unhandled { event_type: String },
}

impl BillingEvent {
    pub fn is_handled(&self) -> bool {
        !matches!(self, BillingEvent::Unhandled { .. })
    }
}

/// Either a bare Stripe id or an expanded object carrying one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            ObjectRef::Id(id) => id,
            ObjectRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
}

impl CheckoutSessionObject {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancellationDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItemObject {
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemObject>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: ObjectRef,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub cancellation_details: Option<CancellationDetails>,
    #[serde(default)]
    pub items: Option<SubscriptionItemList>,
}

impl SubscriptionObject {
    /// Billing period bounds
    ///
    /// Newer Stripe API versions only carry the period on subscription items.
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let first_item = self.items.as_ref().and_then(|items| items.data.first());
        let start = self
            .current_period_start
            .or_else(|| first_item.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| first_item.and_then(|i| i.current_period_end));
        (start, end)
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_details
            .as_ref()
            .and_then(|d| d.reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

impl InvoiceObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }
}

/// Parse a raw webhook body into a [`WebhookEvent`]
pub fn parse_event(payload: &[u8]) -> BillingResult<WebhookEvent> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    parse_event_value(value)
}

/// Parse an already-decoded envelope, e.g. one loaded from the ledger
pub fn parse_event_value(payload: serde_json::Value) -> BillingResult<WebhookEvent> {
    let envelope: EventEnvelope = serde_json::from_value(payload.clone())?;
    let created = timestamp(envelope.created)?;
    let kind = decode_kind(&envelope.event_type, envelope.data.object)?;

    Ok(WebhookEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        created,
        livemode: envelope.livemode,
        kind,
        payload,
    })
}

fn decode_kind(event_type: &str, object: serde_json::Value) -> BillingResult<BillingEvent> {
    let kind = match event_type {
        CHECKOUT_SESSION_COMPLETED => BillingEvent::CheckoutCompleted(decode(event_type, object)?),
        CUSTOMER_SUBSCRIPTION_CREATED => {
            BillingEvent::SubscriptionCreated(decode(event_type, object)?)
        }
        CUSTOMER_SUBSCRIPTION_UPDATED => {
            BillingEvent::SubscriptionUpdated(decode(event_type, object)?)
        }
        CUSTOMER_SUBSCRIPTION_DELETED => {
            BillingEvent::SubscriptionDeleted(decode(event_type, object)?)
        }
        INVOICE_PAYMENT_SUCCEEDED => {
            BillingEvent::InvoicePaymentSucceeded(decode(event_type, object)?)
        }
        INVOICE_PAYMENT_FAILED => BillingEvent::InvoicePaymentFailed(decode(event_type, object)?),
        other => BillingEvent::Unhandled {
            event_type: other.to_string(),
        },
    };
    Ok(kind)
}

fn decode<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::InvalidPayload(format!("{} object did not parse: {}", event_type, e))
    })
}

/// Convert a Stripe unix timestamp
pub fn timestamp(secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::InvalidPayload(format!("Invalid timestamp {}: {}", secs, e)))
}

pub fn opt_timestamp(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_123",
            "object": "event",
            "type": event_type,
            "created": 1_735_689_600,
            "livemode": false,
            "data": { "object": object },
        }))
        .unwrap()
    }

    #[test]
    fn test_checkout_session_parses_with_metadata() {
        let body = envelope(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_test_1",
                "object": "checkout.session",
                "amount_total": 29900,
                "currency": "usd",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": { "userId": "9b0f4c1e-6a43-4a3e-9d0c-3f1f2f7c8a11", "planId": "" },
            }),
        );
        let event = parse_event(&body).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.created.unix_timestamp(), 1_735_689_600);

        let BillingEvent::CheckoutCompleted(session) = event.kind else {
            panic!("expected checkout event");
        };
        assert_eq!(session.amount_total, Some(29900));
        assert!(session.metadata_value("userId").is_some());
        // Empty metadata values behave like missing ones
        assert_eq!(session.metadata_value("planId"), None);
        assert_eq!(session.customer.unwrap().id(), "cus_1");
    }

    #[test]
    fn test_expanded_customer_reference() {
        let body = envelope(
            CUSTOMER_SUBSCRIPTION_UPDATED,
            json!({
                "id": "sub_1",
                "customer": { "id": "cus_9", "object": "customer", "email": "a@b.co" },
                "status": "past_due",
            }),
        );
        let BillingEvent::SubscriptionUpdated(sub) = parse_event(&body).unwrap().kind else {
            panic!("expected subscription update");
        };
        assert_eq!(sub.customer.id(), "cus_9");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_subscription_period_falls_back_to_items() {
        let body = envelope(
            CUSTOMER_SUBSCRIPTION_CREATED,
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "items": { "object": "list", "data": [
                    { "id": "si_1", "current_period_start": 100, "current_period_end": 200 }
                ]},
            }),
        );
        let BillingEvent::SubscriptionCreated(sub) = parse_event(&body).unwrap().kind else {
            panic!("expected subscription created");
        };
        assert_eq!(sub.period(), (Some(100), Some(200)));
    }

    #[test]
    fn test_top_level_period_wins_over_items() {
        let sub = SubscriptionObject {
            id: "sub_1".into(),
            customer: ObjectRef::Id("cus_1".into()),
            status: SubscriptionStatus::Active,
            current_period_start: Some(10),
            current_period_end: Some(20),
            cancel_at: None,
            canceled_at: None,
            cancellation_details: None,
            items: Some(SubscriptionItemList {
                data: vec![SubscriptionItemObject {
                    current_period_start: Some(100),
                    current_period_end: Some(200),
                }],
            }),
        };
        assert_eq!(sub.period(), (Some(10), Some(20)));
    }

    #[test]
    fn test_each_handled_type_maps_to_its_variant() {
        let invoice = json!({ "id": "in_1", "customer": "cus_1", "amount_paid": 100 });
        let sub = json!({ "id": "sub_1", "customer": "cus_1", "status": "canceled" });

        let kind = |t: &str, o: &serde_json::Value| parse_event(&envelope(t, o.clone())).unwrap().kind;

        assert!(matches!(kind(INVOICE_PAYMENT_SUCCEEDED, &invoice), BillingEvent::InvoicePaymentSucceeded(_)));
        assert!(matches!(kind(INVOICE_PAYMENT_FAILED, &invoice), BillingEvent::InvoicePaymentFailed(_)));
        assert!(matches!(kind(CUSTOMER_SUBSCRIPTION_DELETED, &sub), BillingEvent::SubscriptionDeleted(_)));
        assert!(matches!(kind(CUSTOMER_SUBSCRIPTION_CREATED, &sub), BillingEvent::SubscriptionCreated(_)));
    }

    #[test]
    fn test_unknown_type_is_unhandled_not_an_error() {
        let body = envelope("customer.created", json!({ "id": "cus_1" }));
        let event = parse_event(&body).unwrap();
        assert_eq!(
            event.kind,
            BillingEvent::Unhandled {
                event_type: "customer.created".to_string()
            }
        );
        assert!(!event.kind.is_handled());
    }

    #[test]
    fn test_known_type_with_wrong_shape_is_rejected() {
        let body = envelope(CUSTOMER_SUBSCRIPTION_UPDATED, json!({ "id": "sub_1" }));
        let err = parse_event(&body).unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
        assert!(err.to_string().contains(CUSTOMER_SUBSCRIPTION_UPDATED));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            parse_event(b"{not json"),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_handled_event_types_list() {
        assert_eq!(HANDLED_EVENT_TYPES.len(), 6);
        assert!(HANDLED_EVENT_TYPES.contains(&INVOICE_PAYMENT_SUCCEEDED));
    }

    #[test]
    fn test_payload_is_preserved_for_replay() {
        let body = envelope("invoice.finalized", json!({ "id": "in_1" }));
        let event = parse_event(&body).unwrap();
        let reparsed = parse_event_value(event.payload.clone()).unwrap();
        assert_eq!(reparsed.id, event.id);
        assert_eq!(reparsed.event_type, "invoice.finalized");
    }
}
