//! Stripe API client for hosted checkout and payment reconciliation.

use crate::config::StripeConfig;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Metadata key linking provider objects back to our payment row.
pub const METADATA_PAYMENT_ID: &str = "paymentId";

/// Metadata key linking provider objects back to the owning invoice.
pub const METADATA_INVOICE_ID: &str = "invoiceId";

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Webhook event envelope. The payload keeps its raw JSON shape; handlers
/// deserialize it into the object type the event name implies.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    /// Deserialize the event payload into the object shape the event type
    /// implies.
    pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| anyhow!("Malformed {} payload: {}", self.event_type, e))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_intent: Option<String>,
    pub customer: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub latest_charge: Option<String>,
    pub customer: Option<String>,
    #[serde(default)]
    pub charges: Option<ChargeList>,
    pub last_payment_error: Option<LastPaymentError>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PaymentIntent {
    /// The settled charge reference as `(charge_id, balance_transaction_id)`,
    /// preferring the expanded charge list over the bare `latest_charge` id
    /// because only the former carries the balance transaction.
    pub fn settled_charge(&self) -> (Option<String>, Option<String>) {
        if let Some(charge) = self.charges.as_ref().and_then(|c| c.data.first()) {
            (Some(charge.id.clone()), charge.balance_transaction.clone())
        } else {
            (self.latest_charge.clone(), None)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeList {
    #[serde(default)]
    pub data: Vec<Charge>,
}

/// A charge. `amount` and `amount_refunded` are cumulative minor units;
/// `amount_refunded` is the value reconciliation trusts for refunds.
#[derive(Debug, Clone, Deserialize)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    pub payment_intent: Option<String>,
    pub balance_transaction: Option<String>,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Refund {
    pub id: String,
    pub charge: Option<String>,
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastPaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Stripe REST client.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    /// Create a hosted checkout session for an invoice payment. The payment
    /// and invoice ids ride along as metadata on both the session and its
    /// payment intent so webhook events can be tied back to our records even
    /// when the intent id is not yet known to us.
    pub async fn create_checkout_session(
        &self,
        amount_minor: i64,
        currency: &str,
        description: &str,
        payment_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<CheckoutSession> {
        if !self.is_configured() {
            return Err(anyhow!("Stripe secret key is not configured"));
        }

        let amount = amount_minor.to_string();
        let payment_id = payment_id.to_string();
        let invoice_id = invoice_id.to_string();
        let currency = currency.to_lowercase();

        let params: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("success_url", self.config.success_url.as_str()),
            ("cancel_url", self.config.cancel_url.as_str()),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", currency.as_str()),
            ("line_items[0][price_data][unit_amount]", amount.as_str()),
            ("line_items[0][price_data][product_data][name]", description),
            ("metadata[paymentId]", payment_id.as_str()),
            ("metadata[invoiceId]", invoice_id.as_str()),
            (
                "payment_intent_data[metadata][paymentId]",
                payment_id.as_str(),
            ),
            (
                "payment_intent_data[metadata][invoiceId]",
                invoice_id.as_str(),
            ),
        ];

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.config.api_base_url))
            .bearer_auth(self.config.secret_key.expose_secret())
            .form(&params)
            .send()
            .await
            .context("Failed to reach Stripe")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Stripe response")?;

        if status.is_success() {
            tracing::debug!(status = %status, "Checkout session created");
            serde_json::from_str(&body).context("Failed to parse checkout session response")
        } else {
            let message = parse_error_message(&body);
            tracing::error!(status = %status, error = %message, "Checkout session creation failed");
            Err(anyhow!("Stripe error ({}): {}", status, message))
        }
    }

    /// Fetch a charge. Refund reconciliation calls this to read the
    /// authoritative cumulative `amount_refunded` instead of trusting
    /// whatever snapshot rode in on the event.
    pub async fn fetch_charge(&self, charge_id: &str) -> Result<Charge> {
        if !self.is_configured() {
            return Err(anyhow!("Stripe secret key is not configured"));
        }

        let response = self
            .client
            .get(format!("{}/charges/{}", self.config.api_base_url, charge_id))
            .bearer_auth(self.config.secret_key.expose_secret())
            .send()
            .await
            .context("Failed to reach Stripe")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Stripe response")?;

        if status.is_success() {
            tracing::debug!(charge_id = %charge_id, status = %status, "Charge fetched");
            serde_json::from_str(&body).context("Failed to parse charge response")
        } else {
            let message = parse_error_message(&body);
            tracing::error!(charge_id = %charge_id, status = %status, error = %message, "Charge fetch failed");
            Err(anyhow!("Stripe error ({}): {}", status, message))
        }
    }

    /// Parse a webhook body into an event envelope.
    pub fn parse_event(&self, body: &str) -> Result<StripeEvent> {
        serde_json::from_str(body).context("Failed to parse webhook event")
    }

    /// Verify a `Stripe-Signature` header against the raw request body.
    ///
    /// The header format is `t=<unix seconds>,v1=<hex hmac>[,v1=...]`; the
    /// signed payload is `"{t}.{body}"`. Signatures whose timestamp is more
    /// than five minutes from now are rejected to blunt replay. Headers that
    /// do not parse report as invalid rather than erroring.
    pub fn verify_webhook_signature(&self, body: &str, header: &str) -> Result<bool> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let Some(timestamp) = timestamp else {
            return Ok(false);
        };
        if candidates.is_empty() {
            return Ok(false);
        }

        let age = Utc::now().timestamp() - timestamp;
        if age.abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(age_secs = age, "Webhook signature timestamp outside tolerance");
            return Ok(false);
        }

        let expected = self.compute_signature(&format!("{}.{}", timestamp, body))?;
        Ok(candidates.iter().any(|candidate| *candidate == expected))
    }

    fn compute_signature(&self, payload: &str) -> Result<String> {
        let mut mac =
            HmacSha256::new_from_slice(self.config.webhook_secret.expose_secret().as_bytes())
                .map_err(|_| anyhow!("Invalid webhook secret length"))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn parse_error_message(body: &str) -> String {
    serde_json::from_str::<StripeErrorResponse>(body)
        .ok()
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Convert a decimal monetary amount to the provider's integer minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp(0)
        .to_i64()
        .ok_or_else(|| anyhow!("Amount out of range for minor units: {}", amount))
}

/// Convert provider minor units back to a decimal amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
