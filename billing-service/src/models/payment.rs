//! Payment models for provider-initiated reconciliation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment record status, driven entirely by provider webhook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => PaymentStatus::Pending,
            "succeeded" => PaymentStatus::Succeeded,
            "failed" => PaymentStatus::Failed,
            "canceled" => PaymentStatus::Canceled,
            "refunded" => PaymentStatus::Refunded,
            "partially_refunded" => PaymentStatus::PartiallyRefunded,
            _ => PaymentStatus::Pending,
        }
    }

    /// Whether this payment contributes to invoice coverage. Refunded states
    /// still count; their contribution is reduced by the refunded amount.
    pub fn counts_toward_coverage(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded
        )
    }
}

/// Derive the status a payment should carry given its charged amount and the
/// cumulative refunded amount reported by the provider. Fully refunded wins
/// over partially refunded; a zero refund leaves the current status alone.
pub fn refund_status(
    amount: Decimal,
    refunded_amount: Decimal,
    current: PaymentStatus,
) -> PaymentStatus {
    if refunded_amount >= amount && amount > Decimal::ZERO {
        PaymentStatus::Refunded
    } else if refunded_amount > Decimal::ZERO {
        PaymentStatus::PartiallyRefunded
    } else {
        current
    }
}

/// A payment attempt against an invoice. Provider identifiers are filled in
/// progressively as webhook events arrive: the checkout session id at
/// initiation, the payment intent id on completion, the charge id on success.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub provider: String,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub balance_transaction_id: Option<String>,
    pub customer_id: Option<String>,
    pub status: String,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    pub currency: String,
    pub paid_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Payment {
    /// Amount this payment currently contributes to invoice coverage.
    pub fn coverage(&self) -> Decimal {
        if PaymentStatus::from_string(&self.status).counts_toward_coverage() {
            self.amount - self.refunded_amount
        } else {
            Decimal::ZERO
        }
    }
}

/// Input for recording a new pending payment at checkout initiation. The id
/// is generated by the caller so it can be embedded in provider metadata
/// before the row exists.
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub provider: String,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
}
