//! Database service for billing-service.

use crate::models::{
    refund_status, CreateInvoice, CreatePayment, CreateRecurringInvoice, Invoice, InvoiceItem,
    InvoiceStatus, Payment, PaymentStatus, RecurringInvoice, RecurringStatus, SweepRun,
    SweepRunStatus, UpdateInvoice,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::totals::{PricedInvoice, PricedItem};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Create an invoice and its line items in one transaction.
    #[instrument(skip(self, input, priced), fields(user_id = %input.user_id, client_id = %input.client_id))]
    pub async fn create_invoice(
        &self,
        input: &CreateInvoice,
        priced: &PricedInvoice,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice_id = Uuid::new_v4();
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(input.user_id)
        .bind(input.client_id)
        .bind(&input.client_name)
        .bind(&input.client_email)
        .bind(input.status.as_str())
        .bind(&input.currency)
        .bind(input.issue_date)
        .bind(input.due_date)
        .bind(priced.subtotal)
        .bind(priced.tax_total)
        .bind(priced.total)
        .bind(input.recurring_invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        insert_invoice_items(&mut tx, invoice_id, &priced.items).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice.invoice_id, total = %invoice.total, "Invoice created");
        Ok(invoice)
    }

    /// Get an invoice by id.
    #[instrument(skip(self))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    /// Get an invoice's line items in display order.
    #[instrument(skip(self))]
    pub async fn get_invoice_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT item_id, invoice_id, description, quantity, unit_price, tax_rate, subtotal, tax_amount, total, sort_order, created_utc
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY sort_order, created_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice items: {}", e))
        })?;

        timer.observe_duration();
        Ok(items)
    }

    /// Update an invoice. When `priced` is present the stored line items are
    /// replaced wholesale and the invoice totals are rewritten from the new
    /// lines, all in the same transaction as the field updates.
    #[instrument(skip(self, input, priced))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        input: &UpdateInvoice,
        priced: Option<&PricedInvoice>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET client_name = COALESCE($2, client_name),
                client_email = COALESCE($3, client_email),
                status = COALESCE($4, status),
                currency = COALESCE($5, currency),
                issue_date = COALESCE($6, issue_date),
                due_date = COALESCE($7, due_date),
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(&input.client_name)
        .bind(&input.client_email)
        .bind(input.status.map(|s| s.as_str()))
        .bind(&input.currency)
        .bind(input.issue_date)
        .bind(input.due_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

        let Some(mut invoice) = updated else {
            timer.observe_duration();
            return Ok(None);
        };

        if let Some(priced) = priced {
            sqlx::query("DELETE FROM invoice_items WHERE invoice_id = $1")
                .bind(invoice_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to delete invoice items: {}",
                        e
                    ))
                })?;

            insert_invoice_items(&mut tx, invoice_id, &priced.items).await?;

            invoice = sqlx::query_as::<_, Invoice>(
                r#"
                UPDATE invoices
                SET subtotal = $2, tax_total = $3, total = $4, updated_utc = NOW()
                WHERE invoice_id = $1
                RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
                "#,
            )
            .bind(invoice_id)
            .bind(priced.subtotal)
            .bind(priced.tax_total)
            .bind(priced.total)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice totals: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit invoice update: {}", e))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice_id, "Invoice updated");
        Ok(Some(invoice))
    }

    /// Set an invoice's status directly. Reserved for the reconciliation
    /// engine; API-driven status changes go through `update_invoice`.
    #[instrument(skip(self))]
    pub async fn set_invoice_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_invoice_status"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set invoice status: {}", e))
        })?;

        timer.observe_duration();
        Ok(invoice)
    }

    /// Store the generated document reference for an invoice.
    #[instrument(skip(self, document_ref))]
    pub async fn set_document_ref(
        &self,
        invoice_id: Uuid,
        document_ref: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_document_ref"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET document_ref = $2, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(document_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set document ref: {}", e))
        })?;

        timer.observe_duration();
        Ok(invoice)
    }

    /// Bump the delivery counter after a client email goes out.
    #[instrument(skip(self))]
    pub async fn increment_sent_count(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_sent_count"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET sent_count = sent_count + 1, updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING invoice_id, user_id, client_id, client_name, client_email, status, currency, issue_date, due_date, subtotal, tax_total, total, recurring_invoice_id, sent_count, document_ref, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to increment sent count: {}", e))
        })?;

        timer.observe_duration();
        Ok(invoice)
    }

    /// Sum of net settled amounts across this invoice's payments.
    /// The status list must stay in sync with
    /// `PaymentStatus::counts_toward_coverage`.
    #[instrument(skip(self))]
    pub async fn payment_coverage(&self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["payment_coverage"])
            .start_timer();

        let covered = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(amount - refunded_amount), 0)
            FROM payments
            WHERE invoice_id = $1
              AND status IN ('succeeded', 'refunded', 'partially_refunded')
            "#,
        )
        .bind(invoice_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to compute payment coverage: {}", e))
        })?;

        timer.observe_duration();
        Ok(covered)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    /// Record a new pending payment. The caller supplies the id because it is
    /// embedded in provider metadata before this row is written.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn create_payment(&self, input: &CreatePayment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, status, amount, currency)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(input.payment_id)
        .bind(input.invoice_id)
        .bind(&input.provider)
        .bind(&input.checkout_session_id)
        .bind(&input.payment_intent_id)
        .bind(input.amount)
        .bind(&input.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Payment already recorded for this checkout session"
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create payment: {}", e)),
        })?;

        timer.observe_duration();
        info!(payment_id = %payment.payment_id, invoice_id = %payment.invoice_id, "Pending payment recorded");
        Ok(payment)
    }

    /// Get a payment by id.
    #[instrument(skip(self))]
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get payment: {}", e)))?;

        timer.observe_duration();
        Ok(payment)
    }

    /// Find the payment created for a checkout session.
    #[instrument(skip(self))]
    pub async fn get_payment_by_session(
        &self,
        checkout_session_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_by_session"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE checkout_session_id = $1
            "#,
        )
        .bind(checkout_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get payment by session: {}", e))
        })?;

        timer.observe_duration();
        Ok(payment)
    }

    /// Find the payment that owns a payment intent.
    #[instrument(skip(self))]
    pub async fn get_payment_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_by_intent"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE payment_intent_id = $1
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get payment by intent: {}", e))
        })?;

        timer.observe_duration();
        Ok(payment)
    }

    /// Find the payment that owns a charge.
    #[instrument(skip(self))]
    pub async fn get_payment_by_charge(
        &self,
        charge_id: &str,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_by_charge"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE charge_id = $1
            "#,
        )
        .bind(charge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get payment by charge: {}", e))
        })?;

        timer.observe_duration();
        Ok(payment)
    }

    /// List all payments recorded against an invoice, oldest first.
    #[instrument(skip(self))]
    pub async fn list_invoice_payments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE invoice_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list invoice payments: {}", e))
        })?;

        timer.observe_duration();
        Ok(payments)
    }

    /// Attach the identifiers learned when a checkout session completes.
    #[instrument(skip(self))]
    pub async fn attach_checkout_result(
        &self,
        payment_id: Uuid,
        payment_intent_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["attach_checkout_result"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET payment_intent_id = COALESCE($2, payment_intent_id),
                customer_id = COALESCE($3, customer_id),
                updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(payment_id)
        .bind(payment_intent_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to attach checkout result: {}", e))
        })?;

        timer.observe_duration();
        Ok(payment)
    }

    /// Mark a payment as succeeded. Keeps the first settlement time on
    /// duplicate deliveries.
    #[instrument(skip(self))]
    pub async fn mark_payment_succeeded(
        &self,
        payment_id: Uuid,
        charge_id: Option<&str>,
        balance_transaction_id: Option<&str>,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_payment_succeeded"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'succeeded',
                charge_id = COALESCE($2, charge_id),
                balance_transaction_id = COALESCE($3, balance_transaction_id),
                paid_utc = COALESCE(paid_utc, NOW()),
                last_error = NULL,
                updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(payment_id)
        .bind(charge_id)
        .bind(balance_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark payment succeeded: {}", e))
        })?;

        timer.observe_duration();
        if let Some(ref p) = payment {
            info!(payment_id = %p.payment_id, invoice_id = %p.invoice_id, "Payment succeeded");
        }
        Ok(payment)
    }

    /// Mark a payment as failed with the provider's reason.
    #[instrument(skip(self, reason))]
    pub async fn mark_payment_failed(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_payment_failed"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'failed', last_error = $2, updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark payment failed: {}", e))
        })?;

        timer.observe_duration();
        if let Some(ref p) = payment {
            info!(payment_id = %p.payment_id, invoice_id = %p.invoice_id, "Payment failed");
        }
        Ok(payment)
    }

    /// Mark a payment as canceled.
    #[instrument(skip(self))]
    pub async fn mark_payment_canceled(
        &self,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_payment_canceled"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = 'canceled', updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark payment canceled: {}", e))
        })?;

        timer.observe_duration();
        if let Some(ref p) = payment {
            info!(payment_id = %p.payment_id, invoice_id = %p.invoice_id, "Payment canceled");
        }
        Ok(payment)
    }

    /// Apply a cumulative refunded amount reported by the provider. The row
    /// is locked so concurrent refund events serialize, and the stored value
    /// never decreases.
    #[instrument(skip(self))]
    pub async fn apply_refund(
        &self,
        payment_id: Uuid,
        authoritative_refunded: Decimal,
    ) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_refund"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let existing = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            FROM payments
            WHERE payment_id = $1
            FOR UPDATE
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to lock payment for refund: {}", e))
        })?;

        let Some(existing) = existing else {
            timer.observe_duration();
            return Ok(None);
        };

        let refunded = existing
            .refunded_amount
            .max(authoritative_refunded.min(existing.amount));
        let status = refund_status(
            existing.amount,
            refunded,
            PaymentStatus::from_string(&existing.status),
        );

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET refunded_amount = $2, status = $3, updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING payment_id, invoice_id, provider, checkout_session_id, payment_intent_id, charge_id, balance_transaction_id, customer_id, status, amount, refunded_amount, currency, paid_utc, last_error, created_utc, updated_utc
            "#,
        )
        .bind(payment_id)
        .bind(refunded)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to apply refund: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit refund: {}", e))
        })?;

        timer.observe_duration();
        info!(
            payment_id = %payment.payment_id,
            refunded_amount = %payment.refunded_amount,
            status = %payment.status,
            "Refund applied"
        );
        Ok(Some(payment))
    }

    // =========================================================================
    // Recurring Invoice Operations
    // =========================================================================

    /// Create a recurring invoice schedule in `pending` state.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, client_id = %input.client_id))]
    pub async fn create_recurring_invoice(
        &self,
        input: &CreateRecurringInvoice,
    ) -> Result<RecurringInvoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_recurring_invoice"])
            .start_timer();

        let recurring_invoice_id = Uuid::new_v4();
        let schedule = sqlx::query_as::<_, RecurringInvoice>(
            r#"
            INSERT INTO recurring_invoices (recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, auto_pay)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, status, auto_pay, created_utc, updated_utc
            "#,
        )
        .bind(recurring_invoice_id)
        .bind(input.user_id)
        .bind(input.client_id)
        .bind(&input.client_name)
        .bind(&input.client_email)
        .bind(&input.title)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(&input.recurrence_interval)
        .bind(input.day_of_month)
        .bind(input.day_of_week)
        .bind(input.next_send_date)
        .bind(input.auto_pay)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create recurring invoice: {}", e))
        })?;

        timer.observe_duration();
        info!(
            recurring_invoice_id = %schedule.recurring_invoice_id,
            next_send_date = %schedule.next_send_date,
            "Recurring invoice schedule created"
        );
        Ok(schedule)
    }

    /// Get a recurring schedule by id.
    #[instrument(skip(self))]
    pub async fn get_recurring_invoice(
        &self,
        recurring_invoice_id: Uuid,
    ) -> Result<Option<RecurringInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_recurring_invoice"])
            .start_timer();

        let schedule = sqlx::query_as::<_, RecurringInvoice>(
            r#"
            SELECT recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, status, auto_pay, created_utc, updated_utc
            FROM recurring_invoices
            WHERE recurring_invoice_id = $1
            "#,
        )
        .bind(recurring_invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get recurring invoice: {}", e))
        })?;

        timer.observe_duration();
        Ok(schedule)
    }

    /// Set a recurring schedule's status. Transition legality is enforced by
    /// the caller via `RecurringStatus::can_transition_to`.
    #[instrument(skip(self))]
    pub async fn set_recurring_status(
        &self,
        recurring_invoice_id: Uuid,
        status: RecurringStatus,
    ) -> Result<Option<RecurringInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_recurring_status"])
            .start_timer();

        let schedule = sqlx::query_as::<_, RecurringInvoice>(
            r#"
            UPDATE recurring_invoices
            SET status = $2, updated_utc = NOW()
            WHERE recurring_invoice_id = $1
            RETURNING recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, status, auto_pay, created_utc, updated_utc
            "#,
        )
        .bind(recurring_invoice_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set recurring status: {}", e))
        })?;

        timer.observe_duration();
        if let Some(ref s) = schedule {
            info!(
                recurring_invoice_id = %s.recurring_invoice_id,
                status = %s.status,
                "Recurring invoice status changed"
            );
        }
        Ok(schedule)
    }

    /// Advance a schedule's next send date after a successful issue.
    #[instrument(skip(self))]
    pub async fn advance_recurring(
        &self,
        recurring_invoice_id: Uuid,
        next_send_date: NaiveDate,
    ) -> Result<Option<RecurringInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_recurring"])
            .start_timer();

        let schedule = sqlx::query_as::<_, RecurringInvoice>(
            r#"
            UPDATE recurring_invoices
            SET next_send_date = $2, updated_utc = NOW()
            WHERE recurring_invoice_id = $1
            RETURNING recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, status, auto_pay, created_utc, updated_utc
            "#,
        )
        .bind(recurring_invoice_id)
        .bind(next_send_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to advance recurring invoice: {}", e))
        })?;

        timer.observe_duration();
        Ok(schedule)
    }

    /// Find active schedules due on or before the given date.
    #[instrument(skip(self))]
    pub async fn find_due_recurring(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<RecurringInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_due_recurring"])
            .start_timer();

        let schedules = sqlx::query_as::<_, RecurringInvoice>(
            r#"
            SELECT recurring_invoice_id, user_id, client_id, client_name, client_email, title, amount, currency, recurrence_interval, day_of_month, day_of_week, next_send_date, status, auto_pay, created_utc, updated_utc
            FROM recurring_invoices
            WHERE status = 'active' AND next_send_date <= $1
            ORDER BY next_send_date, created_utc
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find due schedules: {}", e))
        })?;

        timer.observe_duration();
        Ok(schedules)
    }

    // =========================================================================
    // Sweep Run Operations
    // =========================================================================

    /// Open a new sweep run in `running` state.
    #[instrument(skip(self))]
    pub async fn create_sweep_run(&self) -> Result<SweepRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_sweep_run"])
            .start_timer();

        let run_id = Uuid::new_v4();
        let run = sqlx::query_as::<_, SweepRun>(
            r#"
            INSERT INTO sweep_runs (run_id, status)
            VALUES ($1, 'running')
            RETURNING run_id, status, started_utc, completed_utc, schedules_processed, schedules_succeeded, schedules_failed, error_message
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create sweep run: {}", e))
        })?;

        timer.observe_duration();
        info!(run_id = %run.run_id, "Sweep run started");
        Ok(run)
    }

    /// Record a sweep run's final counters and status.
    #[instrument(skip(self))]
    pub async fn complete_sweep_run(
        &self,
        run_id: Uuid,
        status: SweepRunStatus,
        processed: i32,
        succeeded: i32,
        failed: i32,
        error_message: Option<&str>,
    ) -> Result<Option<SweepRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_sweep_run"])
            .start_timer();

        let run = sqlx::query_as::<_, SweepRun>(
            r#"
            UPDATE sweep_runs
            SET status = $2,
                schedules_processed = $3,
                schedules_succeeded = $4,
                schedules_failed = $5,
                error_message = $6,
                completed_utc = CASE WHEN $2 <> 'running' THEN NOW() ELSE completed_utc END
            WHERE run_id = $1
            RETURNING run_id, status, started_utc, completed_utc, schedules_processed, schedules_succeeded, schedules_failed, error_message
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(processed)
        .bind(succeeded)
        .bind(failed)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to complete sweep run: {}", e))
        })?;

        timer.observe_duration();
        Ok(run)
    }
}

/// Insert priced line items for an invoice inside an open transaction.
async fn insert_invoice_items(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    invoice_id: Uuid,
    items: &[PricedItem],
) -> Result<(), AppError> {
    for (position, item) in items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO invoice_items (item_id, invoice_id, description, quantity, unit_price, tax_rate, subtotal, tax_amount, total, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.tax_rate)
        .bind(item.subtotal)
        .bind(item.tax_amount)
        .bind(item.total)
        .bind(position as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert invoice item: {}", e))
        })?;
    }
    Ok(())
}
