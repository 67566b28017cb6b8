//! Invoice and line item models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice lifecycle status.
///
/// Every status except `Draft` and `Void` counts as client-visible: the
/// client is expected to be able to see the invoice, so creating or moving
/// an invoice into one of these states triggers document generation and
/// optional delivery email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Unpaid,
    Viewed,
    Paid,
    Overdue,
    Signed,
    Completed,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Viewed => "viewed",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Signed => "signed",
            InvoiceStatus::Completed => "completed",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "draft" => InvoiceStatus::Draft,
            "sent" => InvoiceStatus::Sent,
            "unpaid" => InvoiceStatus::Unpaid,
            "viewed" => InvoiceStatus::Viewed,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "signed" => InvoiceStatus::Signed,
            "completed" => InvoiceStatus::Completed,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }

    pub fn is_client_visible(&self) -> bool {
        !matches!(self, InvoiceStatus::Draft | InvoiceStatus::Void)
    }
}

/// An invoice. Client name and email are snapshots taken at creation time so
/// later client record edits do not rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub client_name: String,
    pub client_email: Option<String>,
    pub status: String,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub recurring_invoice_id: Option<Uuid>,
    pub sent_count: i32,
    pub document_ref: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// A single invoice line. Amounts are computed once at write time and stored
/// alongside the raw inputs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub tax_rate: Option<Decimal>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Raw line item input before pricing.
#[derive(Debug, Clone)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub tax_rate: Option<Decimal>,
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub client_name: String,
    pub client_email: Option<String>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub items: Vec<LineItemInput>,
    pub recurring_invoice_id: Option<Uuid>,
}

/// Input for updating an invoice. `None` fields are left untouched; when
/// `items` is present the stored lines are replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoice {
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub currency: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub items: Option<Vec<LineItemInput>>,
}
