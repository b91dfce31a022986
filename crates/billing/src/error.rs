//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed: {0}")]
    WebhookSignatureInvalid(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Missing field on Stripe object: {0}")]
    MissingField(&'static str),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Errors raised before any side effect, caused by the request itself
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid(_) | BillingError::InvalidPayload(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidPayload(err.to_string())
    }
}
