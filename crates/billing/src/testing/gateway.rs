use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{CheckoutDetails, PaymentsGateway};
use crate::error::{BillingError, BillingResult};

/// [`PaymentsGateway`] answering from a fixed set of checkout sessions
#[derive(Default)]
pub struct StaticGateway {
    sessions: Mutex<HashMap<String, CheckoutDetails>>,
    retrieved: Mutex<Vec<String>>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, details: CheckoutDetails) -> Self {
        self.insert(details);
        self
    }

    pub fn insert(&self, details: CheckoutDetails) {
        lock(&self.sessions).insert(details.session_id.clone(), details);
    }

    /// Session ids requested so far, in call order
    pub fn retrieved(&self) -> Vec<String> {
        lock(&self.retrieved).clone()
    }
}

/// Checkout with an expanded subscription, as Stripe returns it
pub fn checkout_details(
    session_id: &str,
    customer_id: &str,
    subscription_id: &str,
) -> CheckoutDetails {
    CheckoutDetails {
        session_id: session_id.to_string(),
        customer_id: Some(customer_id.to_string()),
        subscription_id: Some(subscription_id.to_string()),
        current_period_start: time::OffsetDateTime::from_unix_timestamp(1_735_689_600).ok(),
        current_period_end: time::OffsetDateTime::from_unix_timestamp(1_738_368_000).ok(),
        amount_total: Some(29_900),
        currency: Some("usd".to_string()),
    }
}

#[async_trait]
impl PaymentsGateway for StaticGateway {
    async fn retrieve_checkout(&self, session_id: &str) -> BillingResult<CheckoutDetails> {
        lock(&self.retrieved).push(session_id.to_string());
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such checkout.session: '{}'", session_id)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
