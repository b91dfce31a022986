//! Stripe webhook signature verification
//!
//! Header format: `t=<unix timestamp>,v1=<hex hmac>[,v1=...][,v0=...]`.
//! The signed payload is `"<t>.<raw body>"`, keyed with the endpoint secret.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Stripe's default replay window
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies that a webhook delivery was signed with the endpoint secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret_len", &self.secret.len())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn tolerance_secs(&self) -> i64 {
        self.tolerance_secs
    }

    /// Verify against the current wall clock
    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit `now` (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<()> {
        let parsed = parse_header(header)?;

        // `t=` is caller-controlled; abs_diff cannot overflow
        let age = now.abs_diff(parsed.timestamp);
        if age > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid(format!(
                "Timestamp outside the tolerance zone ({}s)",
                self.tolerance_secs
            )));
        }

        let expected = self.compute(payload, parsed.timestamp)?;
        let matched = parsed
            .signatures
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

        if !matched {
            return Err(BillingError::WebhookSignatureInvalid(
                "No signatures found matching the expected signature for payload".to_string(),
            ));
        }

        Ok(())
    }

    /// Produce a `stripe-signature` header value for `payload`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let signature = self.compute(payload, timestamp)?;
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    fn compute(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            BillingError::WebhookSignatureInvalid("Invalid webhook secret".to_string())
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn parse_header(header: &str) -> BillingResult<SignatureHeader<'_>> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        BillingError::WebhookSignatureInvalid(
            "Unable to extract timestamp and signatures from header".to_string(),
        )
    })?;

    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid(
            "No signatures found with expected scheme v1".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}
