//! HTTP routes

mod health;
mod webhooks;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub use health::HealthResponse;
pub use webhooks::WebhookAck;

/// Stripe event payloads are far smaller; anything larger is not a delivery
pub const WEBHOOK_BODY_LIMIT: usize = 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/webhooks/stripe",
            post(webhooks::stripe_webhook)
                .fallback(webhooks::method_not_allowed)
                .layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .with_state(state)
}
