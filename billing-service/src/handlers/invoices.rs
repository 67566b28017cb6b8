//! Invoice handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CreateInvoice, CreatePayment, Invoice, InvoiceItem, InvoiceStatus, LineItemInput, Payment,
    UpdateInvoice,
};
use crate::services::stripe::to_minor_units;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct LineItemRequest {
    #[validate(length(min = 1, message = "Description cannot be empty"))]
    pub description: String,
    #[validate(range(min = 0, message = "Quantity cannot be negative"))]
    pub quantity: i32,
    pub unit_price: Decimal,
    pub tax_rate: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    #[validate(required(message = "user_id is required"))]
    pub user_id: Option<Uuid>,
    #[validate(required(message = "client_id is required"))]
    pub client_id: Option<Uuid>,
    #[validate(length(min = 1, message = "Client name cannot be empty"))]
    pub client_name: String,
    #[validate(email(message = "Invalid client email address"))]
    pub client_email: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub currency: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    #[validate(nested)]
    #[serde(default)]
    pub items: Vec<LineItemRequest>,
    /// Whether to email the client when the invoice is client-visible.
    #[serde(default = "default_send_email")]
    pub send_email: bool,
}

fn default_send_email() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateInvoiceRequest {
    #[validate(length(min = 1, message = "Client name cannot be empty"))]
    pub client_name: Option<String>,
    #[validate(email(message = "Invalid client email address"))]
    pub client_email: Option<String>,
    pub status: Option<InvoiceStatus>,
    pub currency: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    /// When present, replaces all stored line items.
    #[validate(nested)]
    pub items: Option<Vec<LineItemRequest>>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub payment_id: Uuid,
    pub checkout_session_id: String,
    pub checkout_url: Option<String>,
}

/// Create an invoice with its line items.
#[tracing::instrument(skip(state, request))]
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    request.validate()?;
    let items = to_line_items(&request.items)?;

    let user_id = request
        .user_id
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("user_id is required")))?;
    let client_id = request
        .client_id
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("client_id is required")))?;

    let input = CreateInvoice {
        user_id,
        client_id,
        client_name: request.client_name,
        client_email: request.client_email,
        status: request.status.unwrap_or(InvoiceStatus::Draft),
        currency: request.currency.unwrap_or_else(|| "usd".to_string()),
        issue_date: request.issue_date,
        due_date: request.due_date,
        items,
        recurring_invoice_id: None,
    };

    let (invoice, items) = state
        .lifecycle
        .create_invoice(&input, request.send_email)
        .await?;
    Ok((StatusCode::CREATED, Json(InvoiceResponse { invoice, items })))
}

/// Get an invoice with its line items.
#[tracing::instrument(skip(state))]
pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state
        .db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
    let items = state.db.get_invoice_items(invoice_id).await?;
    Ok(Json(InvoiceResponse { invoice, items }))
}

/// Update an invoice. Supplying `items` replaces the full line set and
/// recomputes totals.
#[tracing::instrument(skip(state, request))]
pub async fn update_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(request): Json<UpdateInvoiceRequest>,
) -> Result<Json<InvoiceResponse>, AppError> {
    request.validate()?;
    let items = match &request.items {
        Some(items) => Some(to_line_items(items)?),
        None => None,
    };

    let input = UpdateInvoice {
        client_name: request.client_name,
        client_email: request.client_email,
        status: request.status,
        currency: request.currency,
        issue_date: request.issue_date,
        due_date: request.due_date,
        items,
    };

    let (invoice, items) = state.lifecycle.update_invoice(invoice_id, &input).await?;
    Ok(Json(InvoiceResponse { invoice, items }))
}

/// List the payments recorded against an invoice, oldest first.
#[tracing::instrument(skip(state))]
pub async fn list_invoice_payments(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, AppError> {
    state
        .db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
    let payments = state.db.list_invoice_payments(invoice_id).await?;
    Ok(Json(payments))
}

/// Start a hosted checkout for an invoice. Records a pending payment whose
/// id rides along in provider metadata so later webhook events can be tied
/// back even before the session completes.
#[tracing::instrument(skip(state))]
pub async fn create_checkout(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    let invoice = state
        .db
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;

    let status = InvoiceStatus::from_string(&invoice.status);
    if matches!(
        status,
        InvoiceStatus::Draft | InvoiceStatus::Void | InvoiceStatus::Paid
    ) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice is not payable in status {}",
            invoice.status
        )));
    }
    if invoice.total <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice total must be positive to start checkout"
        )));
    }
    if !state.stripe.is_configured() {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "Stripe is not configured"
        )));
    }

    let amount_minor = to_minor_units(invoice.total).map_err(AppError::BadRequest)?;
    let payment_id = Uuid::new_v4();
    let description = format!("Invoice {}", invoice.invoice_id);

    let session = state
        .stripe
        .create_checkout_session(
            amount_minor,
            &invoice.currency,
            &description,
            payment_id,
            invoice.invoice_id,
        )
        .await
        .map_err(AppError::ProviderError)?;

    let payment = state
        .db
        .create_payment(&CreatePayment {
            payment_id,
            invoice_id: invoice.invoice_id,
            provider: "stripe".to_string(),
            checkout_session_id: Some(session.id.clone()),
            payment_intent_id: session.payment_intent.clone(),
            amount: invoice.total,
            currency: invoice.currency.clone(),
        })
        .await?;

    tracing::info!(
        invoice_id = %invoice.invoice_id,
        payment_id = %payment.payment_id,
        checkout_session_id = %session.id,
        "Checkout session started"
    );

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            payment_id: payment.payment_id,
            checkout_session_id: session.id,
            checkout_url: session.url,
        }),
    ))
}

/// Money fields cannot be range-checked by the derive; guard them here.
fn to_line_items(items: &[LineItemRequest]) -> Result<Vec<LineItemInput>, AppError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if item.unit_price < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Unit price cannot be negative"
            )));
        }
        if item.tax_rate.is_some_and(|rate| rate < Decimal::ZERO) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Tax rate cannot be negative"
            )));
        }
        out.push(LineItemInput {
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            tax_rate: item.tax_rate,
        });
    }
    Ok(out)
}
