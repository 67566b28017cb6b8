//! Recurring invoice schedule handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{CreateRecurringInvoice, RecurringInvoice, RecurringStatus};
use crate::services::schedule::RecurrenceInterval;
use crate::services::sweep::SweepOutcome;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRecurringRequest {
    #[validate(required(message = "user_id is required"))]
    pub user_id: Option<Uuid>,
    #[validate(required(message = "client_id is required"))]
    pub client_id: Option<Uuid>,
    #[validate(length(min = 1, message = "Client name cannot be empty"))]
    pub client_name: String,
    #[validate(email(message = "Invalid client email address"))]
    pub client_email: Option<String>,
    #[validate(length(min = 1, message = "Title cannot be empty"))]
    pub title: String,
    pub amount: Decimal,
    pub currency: Option<String>,
    /// One of `day`, `week`, `month`, `year`.
    pub recurrence_interval: String,
    #[validate(range(min = 1, max = 31, message = "day_of_month must be between 1 and 31"))]
    pub day_of_month: Option<i32>,
    #[validate(range(min = 0, max = 6, message = "day_of_week must be between 0 (Sunday) and 6"))]
    pub day_of_week: Option<i32>,
    pub next_send_date: NaiveDate,
    #[serde(default)]
    pub auto_pay: bool,
}

/// Create a recurring schedule. Schedules start `pending` and are picked up
/// by the sweep only after activation.
#[tracing::instrument(skip(state, request))]
pub async fn create_recurring(
    State(state): State<AppState>,
    Json(request): Json<CreateRecurringRequest>,
) -> Result<(StatusCode, Json<RecurringInvoice>), AppError> {
    request.validate()?;
    RecurrenceInterval::parse(&request.recurrence_interval)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;
    if request.amount < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Amount cannot be negative"
        )));
    }

    let user_id = request
        .user_id
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("user_id is required")))?;
    let client_id = request
        .client_id
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("client_id is required")))?;

    let schedule = state
        .db
        .create_recurring_invoice(&CreateRecurringInvoice {
            user_id,
            client_id,
            client_name: request.client_name,
            client_email: request.client_email,
            title: request.title,
            amount: request.amount,
            currency: request.currency.unwrap_or_else(|| "usd".to_string()),
            recurrence_interval: request.recurrence_interval,
            day_of_month: request.day_of_month,
            day_of_week: request.day_of_week,
            next_send_date: request.next_send_date,
            auto_pay: request.auto_pay,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(schedule)))
}

/// Get a recurring schedule.
#[tracing::instrument(skip(state))]
pub async fn get_recurring(
    State(state): State<AppState>,
    Path(recurring_invoice_id): Path<Uuid>,
) -> Result<Json<RecurringInvoice>, AppError> {
    let schedule = state
        .db
        .get_recurring_invoice(recurring_invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Recurring invoice not found")))?;
    Ok(Json(schedule))
}

/// Activate a pending or paused schedule.
#[tracing::instrument(skip(state))]
pub async fn activate_recurring(
    State(state): State<AppState>,
    Path(recurring_invoice_id): Path<Uuid>,
) -> Result<Json<RecurringInvoice>, AppError> {
    transition(&state, recurring_invoice_id, RecurringStatus::Active).await
}

/// Pause an active schedule.
#[tracing::instrument(skip(state))]
pub async fn pause_recurring(
    State(state): State<AppState>,
    Path(recurring_invoice_id): Path<Uuid>,
) -> Result<Json<RecurringInvoice>, AppError> {
    transition(&state, recurring_invoice_id, RecurringStatus::Paused).await
}

/// Cancel a schedule. Cancellation is terminal.
#[tracing::instrument(skip(state))]
pub async fn cancel_recurring(
    State(state): State<AppState>,
    Path(recurring_invoice_id): Path<Uuid>,
) -> Result<Json<RecurringInvoice>, AppError> {
    transition(&state, recurring_invoice_id, RecurringStatus::Cancelled).await
}

/// Run the due-schedule sweep. Invoked by an external time-based trigger.
#[tracing::instrument(skip(state))]
pub async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepOutcome>, AppError> {
    let outcome = state.sweeper.process_due_schedules().await?;
    Ok(Json(outcome))
}

async fn transition(
    state: &AppState,
    recurring_invoice_id: Uuid,
    next: RecurringStatus,
) -> Result<Json<RecurringInvoice>, AppError> {
    let schedule = state
        .db
        .get_recurring_invoice(recurring_invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Recurring invoice not found")))?;

    let current = RecurringStatus::from_string(&schedule.status);
    if !current.can_transition_to(next) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Cannot move schedule from {} to {}",
            schedule.status,
            next.as_str()
        )));
    }

    let updated = state
        .db
        .set_recurring_status(recurring_invoice_id, next)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Recurring invoice not found")))?;
    Ok(Json(updated))
}
