//! Recurring invoice schedules and sweep run bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Recurring schedule status.
///
/// Schedules are created `Pending` and must be explicitly activated before
/// the sweep will pick them up. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringStatus {
    Pending,
    Active,
    Paused,
    Cancelled,
}

impl RecurringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringStatus::Pending => "pending",
            RecurringStatus::Active => "active",
            RecurringStatus::Paused => "paused",
            RecurringStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "pending" => RecurringStatus::Pending,
            "active" => RecurringStatus::Active,
            "paused" => RecurringStatus::Paused,
            "cancelled" => RecurringStatus::Cancelled,
            _ => RecurringStatus::Pending,
        }
    }

    pub fn can_transition_to(&self, next: RecurringStatus) -> bool {
        matches!(
            (self, next),
            (RecurringStatus::Pending, RecurringStatus::Active)
                | (RecurringStatus::Active, RecurringStatus::Paused)
                | (RecurringStatus::Active, RecurringStatus::Cancelled)
                | (RecurringStatus::Paused, RecurringStatus::Active)
                | (RecurringStatus::Paused, RecurringStatus::Cancelled)
                | (RecurringStatus::Pending, RecurringStatus::Cancelled)
        )
    }
}

/// A recurring invoice schedule. Client details are snapshotted onto each
/// generated invoice. `next_send_date` is the sweep's due marker; anchors
/// (`day_of_month`, `day_of_week`) refine how it advances.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurringInvoice {
    pub recurring_invoice_id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub client_name: String,
    pub client_email: Option<String>,
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
    pub recurrence_interval: String,
    pub day_of_month: Option<i32>,
    pub day_of_week: Option<i32>,
    pub next_send_date: NaiveDate,
    pub status: String,
    pub auto_pay: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a recurring schedule.
#[derive(Debug, Clone)]
pub struct CreateRecurringInvoice {
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub client_name: String,
    pub client_email: Option<String>,
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
    pub recurrence_interval: String,
    pub day_of_month: Option<i32>,
    pub day_of_week: Option<i32>,
    pub next_send_date: NaiveDate,
    pub auto_pay: bool,
}

/// Sweep run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepRunStatus {
    Running,
    Completed,
    Failed,
}

impl SweepRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepRunStatus::Running => "running",
            SweepRunStatus::Completed => "completed",
            SweepRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "running" => SweepRunStatus::Running,
            "completed" => SweepRunStatus::Completed,
            "failed" => SweepRunStatus::Failed,
            _ => SweepRunStatus::Running,
        }
    }
}

/// Audit record for one sweep invocation. A run completes even when some
/// schedules fail; per-schedule failures only bump the failed counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SweepRun {
    pub run_id: Uuid,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub schedules_processed: i32,
    pub schedules_succeeded: i32,
    pub schedules_failed: i32,
    pub error_message: Option<String>,
}
