//! Stripe API client and the payments port used by the webhook handlers

use std::fmt;

use async_trait::async_trait;
use stripe::{CheckoutSession, CheckoutSessionId, Client, Expandable};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::opt_timestamp;

/// Stripe credentials
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &redact(&self.secret_key))
            .field("webhook_secret", &redact(&self.webhook_secret))
            .finish()
    }
}

fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{}… ({} chars)", prefix, secret.len())
}

impl StripeConfig {
    /// Read `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        if secret_key.is_empty() || webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "Stripe credentials must not be empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            inner: Client::new(config.secret_key.clone()),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }
}

/// Checkout session as re-fetched from Stripe with its subscription and
/// customer expanded
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutDetails {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

/// Outbound calls to the payments platform
#[async_trait]
pub trait PaymentsGateway: Send + Sync {
    /// Retrieve a checkout session, expanding line items, customer and subscription
    async fn retrieve_checkout(&self, session_id: &str) -> BillingResult<CheckoutDetails>;
}

/// [`PaymentsGateway`] backed by the Stripe REST API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

const CHECKOUT_EXPAND: &[&str] = &["line_items", "customer", "subscription"];

#[async_trait]
impl PaymentsGateway for StripeGateway {
    async fn retrieve_checkout(&self, session_id: &str) -> BillingResult<CheckoutDetails> {
        let id = session_id.parse::<CheckoutSessionId>().map_err(|e| {
            BillingError::InvalidPayload(format!("Invalid checkout session id: {}", e))
        })?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &id, CHECKOUT_EXPAND).await?;

        let customer_id = session.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        });

        let (subscription_id, period_start, period_end) = match &session.subscription {
            Some(Expandable::Object(sub)) => (
                Some(sub.id.to_string()),
                Some(sub.current_period_start),
                Some(sub.current_period_end),
            ),
            Some(Expandable::Id(id)) => {
                tracing::warn!(
                    session_id = %session_id,
                    subscription_id = %id,
                    "Checkout subscription was not expanded, billing period unknown"
                );
                (Some(id.to_string()), None, None)
            }
            None => (None, None, None),
        };

        Ok(CheckoutDetails {
            session_id: session.id.to_string(),
            customer_id,
            subscription_id,
            current_period_start: opt_timestamp(period_start)?,
            current_period_end: opt_timestamp(period_end)?,
            amount_total: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
        })
    }
}
