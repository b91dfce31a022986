//! HTTP error mapping for the webhook surface
//!
//! Bodies are plain text; the payments platform only looks at the status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bizpilot_billing::BillingError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The delivery itself is unacceptable; retrying it cannot succeed
    #[error("Webhook Error: {0}")]
    Rejected(String),

    /// Processing failed after the delivery was accepted
    #[error("Webhook handler failed: {0}")]
    HandlerFailed(String),

    #[error("Method Not Allowed")]
    MethodNotAllowed,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Rejected(_) => StatusCode::BAD_REQUEST,
            ApiError::HandlerFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid(msg) | BillingError::InvalidPayload(msg) => {
                ApiError::Rejected(msg)
            }
            other => ApiError::HandlerFailed(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Webhook request failed");
        }
        (status, self.to_string()).into_response()
    }
}
