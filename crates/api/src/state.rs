//! Application state

use std::sync::Arc;

use bizpilot_billing::WebhookHandler;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(webhooks: Arc<WebhookHandler>) -> Self {
        Self { webhooks }
    }

    /// Wire the webhook handler to Postgres and the Stripe API
    pub fn from_config(config: &Config, pool: PgPool) -> Self {
        let handler = bizpilot_billing::webhook_handler(
            config.stripe_config(),
            pool,
            config.webhook_tolerance_secs,
        );
        Self::new(Arc::new(handler))
    }
}
