//! Recurring invoice sweep.
//!
//! Finds active schedules whose next send date has arrived, issues an
//! invoice for each through the lifecycle manager and advances the schedule.
//! Each schedule is processed independently: one failure is recorded in the
//! outcome and the pass moves on.

use crate::models::{CreateInvoice, InvoiceStatus, LineItemInput, RecurringInvoice, SweepRunStatus};
use crate::services::database::Database;
use crate::services::lifecycle::InvoiceLifecycle;
use crate::services::metrics::record_sweep_schedule;
use crate::services::schedule::next_occurrence;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One failed schedule in a sweep pass.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub id: Uuid,
    pub error: String,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Serialize)]
pub struct SweepOutcome {
    pub processed: u32,
    pub errors: Vec<SweepFailure>,
}

#[derive(Clone)]
pub struct RecurringSweeper {
    db: Arc<Database>,
    lifecycle: InvoiceLifecycle,
}

impl RecurringSweeper {
    pub fn new(db: Arc<Database>, lifecycle: InvoiceLifecycle) -> Self {
        Self { db, lifecycle }
    }

    /// Issue invoices for every active schedule due today or earlier.
    ///
    /// Re-running is safe in the at-least-once sense: a crash between invoice
    /// creation and schedule advancement leaves the schedule due, so the next
    /// pass issues that invoice again. There is no per-period idempotency
    /// key; callers triggering the sweep should expect possible duplicates
    /// after a mid-pass crash.
    #[instrument(skip(self))]
    pub async fn process_due_schedules(&self) -> Result<SweepOutcome, AppError> {
        let run = self.db.create_sweep_run().await?;
        let today = Utc::now().date_naive();

        let due = match self.db.find_due_recurring(today).await {
            Ok(due) => due,
            Err(e) => {
                if let Err(complete_err) = self
                    .db
                    .complete_sweep_run(
                        run.run_id,
                        SweepRunStatus::Failed,
                        0,
                        0,
                        0,
                        Some(&e.to_string()),
                    )
                    .await
                {
                    warn!(run_id = %run.run_id, error = %complete_err, "Failed to record sweep failure");
                }
                return Err(e);
            }
        };

        info!(run_id = %run.run_id, due = due.len(), "Recurring sweep started");

        let mut processed: u32 = 0;
        let mut errors: Vec<SweepFailure> = Vec::new();

        for schedule in &due {
            match self.process_schedule(schedule, today).await {
                Ok(invoice_id) => {
                    processed += 1;
                    record_sweep_schedule("succeeded");
                    info!(
                        recurring_invoice_id = %schedule.recurring_invoice_id,
                        invoice_id = %invoice_id,
                        "Recurring schedule issued an invoice"
                    );
                }
                Err(e) => {
                    record_sweep_schedule("failed");
                    warn!(
                        recurring_invoice_id = %schedule.recurring_invoice_id,
                        error = %e,
                        "Recurring schedule failed"
                    );
                    errors.push(SweepFailure {
                        id: schedule.recurring_invoice_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.db
            .complete_sweep_run(
                run.run_id,
                SweepRunStatus::Completed,
                due.len() as i32,
                processed as i32,
                errors.len() as i32,
                None,
            )
            .await?;

        info!(
            run_id = %run.run_id,
            processed = processed,
            failed = errors.len(),
            "Recurring sweep finished"
        );
        Ok(SweepOutcome { processed, errors })
    }

    /// Issue one schedule's invoice and advance its due date. The next date
    /// is computed first so a bad recurrence rule fails the schedule before
    /// anything is written.
    async fn process_schedule(
        &self,
        schedule: &RecurringInvoice,
        today: NaiveDate,
    ) -> Result<Uuid, AppError> {
        let next = next_occurrence(
            today,
            &schedule.recurrence_interval,
            schedule.day_of_month,
            schedule.day_of_week,
        )
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

        let input = CreateInvoice {
            user_id: schedule.user_id,
            client_id: schedule.client_id,
            client_name: schedule.client_name.clone(),
            client_email: schedule.client_email.clone(),
            status: InvoiceStatus::Sent,
            currency: schedule.currency.clone(),
            issue_date: Some(today),
            due_date: None,
            items: vec![LineItemInput {
                description: schedule.title.clone(),
                quantity: 1,
                unit_price: schedule.amount,
                tax_rate: None,
            }],
            recurring_invoice_id: Some(schedule.recurring_invoice_id),
        };

        let (invoice, _items) = self.lifecycle.create_invoice(&input, true).await?;
        self.db
            .advance_recurring(schedule.recurring_invoice_id, next)
            .await?;
        Ok(invoice.invoice_id)
    }
}
