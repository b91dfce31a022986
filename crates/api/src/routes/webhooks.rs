//! Stripe webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact bytes
//! Stripe sent, so it must be verified before any JSON parsing.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const STRIPE_SIGNATURE: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// Handle Stripe webhook events
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(STRIPE_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing Stripe-Signature header");
            ApiError::Rejected("No stripe-signature header value was provided.".to_string())
        })?;

    let event = state.webhooks.verify_event(&body, signature)?;
    let event_id = event.id.clone();
    let event_type = event.event_type.clone();

    let outcome = state.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(
            event_id = %event_id,
            event_type = %event_type,
            error = %e,
            "Webhook handler failed"
        );
        e
    })?;

    tracing::debug!(
        event_id = %event_id,
        event_type = %event_type,
        outcome = ?outcome,
        "Webhook acknowledged"
    );

    Ok(Json(WebhookAck { received: true }))
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use bizpilot_billing::events::{
        CHECKOUT_SESSION_COMPLETED, CUSTOMER_SUBSCRIPTION_DELETED, INVOICE_PAYMENT_SUCCEEDED,
    };
    use bizpilot_billing::testing::*;
    use bizpilot_billing::{WebhookHandler, WebhookVerifier};
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::routes::create_router;
    use crate::state::AppState;

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
    }

    fn app(store: MemoryStore, gateway: StaticGateway) -> TestApp {
        let store = Arc::new(store);
        let handler = WebhookHandler::new(
            WebhookVerifier::new(TEST_WEBHOOK_SECRET),
            store.clone(),
            Arc::new(gateway),
        );
        TestApp {
            router: create_router(AppState::new(Arc::new(handler))),
            store,
        }
    }

    fn delivery(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn signed_delivery(event_id: &str, event_type: &str, object: serde_json::Value) -> Request<Body> {
        let body = event_body(event_id, event_type, object);
        let signature = signed(&body).unwrap();
        delivery(body, Some(&signature))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_get_is_method_not_allowed() {
        let app = app(MemoryStore::new(), StaticGateway::new());
        let request = Request::builder()
            .method("GET")
            .uri("/webhooks/stripe")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "Method Not Allowed");
        assert!(app.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_header() {
        let app = app(MemoryStore::new(), StaticGateway::new());
        let body = event_body("evt_1", INVOICE_PAYMENT_SUCCEEDED, json!({ "id": "in_1" }));

        let (status, text) = send(&app.router, delivery(body, None)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.starts_with("Webhook Error: "));
        assert!(app.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signature_writes_nothing() {
        let app = app(MemoryStore::new(), StaticGateway::new());
        let body = event_body("evt_1", INVOICE_PAYMENT_SUCCEEDED, json!({ "id": "in_1" }));

        let (status, text) = send(&app.router, delivery(body, Some("t=1,v1=deadbeef"))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.starts_with("Webhook Error: "));
        assert!(app.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_checkout_delivery_activates_subscription() {
        let user_id = Uuid::new_v4();
        let app = app(
            MemoryStore::new().with_profile(user_id),
            StaticGateway::new().with_session(checkout_details("cs_1", "cus_1", "sub_1")),
        );

        let (status, body) = send(
            &app.router,
            signed_delivery(
                "evt_1",
                CHECKOUT_SESSION_COMPLETED,
                checkout_completed("cs_1", Some(user_id), Some("starter")),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"received":true}"#);
        assert_eq!(app.store.profile(user_id).unwrap().subscription_tier, "starter");
    }

    #[tokio::test]
    async fn test_checkout_without_user_id_is_acknowledged() {
        let app = app(
            MemoryStore::new(),
            StaticGateway::new().with_session(checkout_details("cs_1", "cus_1", "sub_1")),
        );

        let (status, _) = send(
            &app.router,
            signed_delivery(
                "evt_1",
                CHECKOUT_SESSION_COMPLETED,
                checkout_completed("cs_1", None, None),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(app.store.billing_writes().is_empty());
    }

    #[tokio::test]
    async fn test_primary_write_failure_returns_500() {
        let user_id = Uuid::new_v4();
        let app = app(
            MemoryStore::new().with_profile(user_id),
            StaticGateway::new().with_session(checkout_details("cs_1", "cus_1", "sub_1")),
        );
        app.store.fail_on(StoreOp::ActivateSubscription);

        let (status, body) = send(
            &app.router,
            signed_delivery(
                "evt_1",
                CHECKOUT_SESSION_COMPLETED,
                checkout_completed("cs_1", Some(user_id), Some("professional")),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Webhook handler failed: "));
        assert_eq!(app.store.profile(user_id).unwrap().subscription_tier, "free");
        assert!(!app.store.was_called(StoreOp::LogActivity));
    }

    #[tokio::test]
    async fn test_unknown_customer_is_acknowledged_without_writes() {
        let app = app(MemoryStore::new(), StaticGateway::new());

        let (status, _) = send(
            &app.router,
            signed_delivery(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_DELETED,
                subscription_deleted("sub_1", "cus_unknown", None),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(app.store.billing_writes().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_once_applied() {
        let app = app(
            MemoryStore::new().with_subscription(Uuid::new_v4(), "cus_1", "sub_1"),
            StaticGateway::new(),
        );
        let body = event_body(
            "evt_1",
            INVOICE_PAYMENT_SUCCEEDED,
            invoice_payment_succeeded("in_1", "cus_1", 29_900),
        );
        let signature = signed(&body).unwrap();

        let (first, _) = send(&app.router, delivery(body.clone(), Some(&signature))).await;
        let (second, _) = send(&app.router, delivery(body, Some(&signature))).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(app.store.metrics().len(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_acknowledged() {
        let app = app(MemoryStore::new(), StaticGateway::new());

        let (status, _) = send(
            &app.router,
            signed_delivery("evt_1", "payment_intent.created", json!({ "id": "pi_1" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(app.store.billing_writes().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let app = app(MemoryStore::new(), StaticGateway::new());
        let body = vec![b' '; crate::routes::WEBHOOK_BODY_LIMIT + 1];

        let (status, _) = send(&app.router, delivery(body, Some("t=1,v1=00"))).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(app.store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(MemoryStore::new(), StaticGateway::new());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&app.router, request).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }
}
