//! Invoice lifecycle orchestration.
//!
//! Pricing and persistence run inside database transactions. Document
//! generation and email delivery are side effects of a committed invoice:
//! their failures are logged and never roll the invoice back.

use crate::models::{CreateInvoice, Invoice, InvoiceItem, InvoiceStatus, UpdateInvoice};
use crate::services::database::Database;
use crate::services::documents::DocumentStore;
use crate::services::mailer::{EmailMessage, Mailer};
use crate::services::metrics::{record_invoice_amount, record_invoice_created};
use crate::services::totals::price_invoice;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct InvoiceLifecycle {
    db: Arc<Database>,
    mailer: Arc<dyn Mailer>,
    documents: Arc<dyn DocumentStore>,
}

impl InvoiceLifecycle {
    pub fn new(
        db: Arc<Database>,
        mailer: Arc<dyn Mailer>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            db,
            mailer,
            documents,
        }
    }

    /// Price and persist a new invoice, then run delivery side effects when
    /// the invoice starts in a client-visible status.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, client_id = %input.client_id))]
    pub async fn create_invoice(
        &self,
        input: &CreateInvoice,
        send_email: bool,
    ) -> Result<(Invoice, Vec<InvoiceItem>), AppError> {
        let priced = price_invoice(&input.items);
        let mut invoice = self.db.create_invoice(input, &priced).await?;
        let items = self.db.get_invoice_items(invoice.invoice_id).await?;

        record_invoice_created(&invoice.status);
        record_invoice_amount(&invoice.currency, invoice.total.to_f64().unwrap_or(0.0));

        if input.status.is_client_visible() {
            if let Some(updated) = self.generate_document(&invoice, &items).await {
                invoice = updated;
            }
            if send_email {
                if let Some(updated) = self.send_client_email(&invoice).await {
                    invoice = updated;
                }
            }
        }

        Ok((invoice, items))
    }

    /// Update invoice fields and, when new lines are supplied, replace the
    /// stored line items. Document generation fires only when the update
    /// moves the invoice into a client-visible status and no document exists
    /// yet; edits within a visible status keep the original document.
    #[instrument(skip(self, input))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        input: &UpdateInvoice,
    ) -> Result<(Invoice, Vec<InvoiceItem>), AppError> {
        let existing = self
            .db
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        let was_visible = InvoiceStatus::from_string(&existing.status).is_client_visible();

        let priced = input.items.as_ref().map(|items| price_invoice(items));
        let mut invoice = self
            .db
            .update_invoice(invoice_id, input, priced.as_ref())
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        let items = self.db.get_invoice_items(invoice_id).await?;

        let now_visible = InvoiceStatus::from_string(&invoice.status).is_client_visible();
        if !was_visible && now_visible && invoice.document_ref.is_none() {
            if let Some(updated) = self.generate_document(&invoice, &items).await {
                invoice = updated;
            }
        }

        Ok((invoice, items))
    }

    /// Re-derive the invoice's paid state from its payments. Called after
    /// every payment mutation. Void invoices are frozen; a previously paid
    /// invoice whose coverage drops reverts to `unpaid`.
    #[instrument(skip(self))]
    pub async fn recompute_payment_status(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let Some(invoice) = self.db.get_invoice(invoice_id).await? else {
            warn!(invoice_id = %invoice_id, "Invoice missing during payment status recompute");
            return Ok(None);
        };

        let current = InvoiceStatus::from_string(&invoice.status);
        if current == InvoiceStatus::Void {
            return Ok(Some(invoice));
        }

        let covered = self.db.payment_coverage(invoice_id).await?;
        let next = if covered >= invoice.total && invoice.total > Decimal::ZERO {
            InvoiceStatus::Paid
        } else if current == InvoiceStatus::Paid {
            InvoiceStatus::Unpaid
        } else {
            current
        };

        if next == current {
            return Ok(Some(invoice));
        }

        let updated = self.db.set_invoice_status(invoice_id, next).await?;
        if let Some(ref inv) = updated {
            info!(
                invoice_id = %invoice_id,
                from = current.as_str(),
                to = %inv.status,
                covered = %covered,
                "Invoice payment status recomputed"
            );
        }
        Ok(updated)
    }

    async fn generate_document(
        &self,
        invoice: &Invoice,
        items: &[InvoiceItem],
    ) -> Option<Invoice> {
        if !self.documents.is_enabled() {
            debug!(invoice_id = %invoice.invoice_id, "Document rendering disabled, skipping");
            return None;
        }

        match self.documents.render_invoice(invoice, items).await {
            Ok(document_ref) => {
                match self.db.set_document_ref(invoice.invoice_id, &document_ref).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(
                            invoice_id = %invoice.invoice_id,
                            error = %e,
                            "Rendered document reference could not be stored"
                        );
                        None
                    }
                }
            }
            Err(e) => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Invoice document generation failed"
                );
                None
            }
        }
    }

    async fn send_client_email(&self, invoice: &Invoice) -> Option<Invoice> {
        let Some(to) = invoice.client_email.clone() else {
            info!(invoice_id = %invoice.invoice_id, "Invoice has no client email, skipping delivery");
            return None;
        };
        if !self.mailer.is_enabled() {
            debug!(invoice_id = %invoice.invoice_id, "Mailer disabled, skipping invoice email");
            return None;
        }

        let email = invoice_email(invoice, to);
        match self.mailer.send(&email).await {
            Ok(()) => match self.db.increment_sent_count(invoice.invoice_id).await {
                Ok(updated) => {
                    info!(invoice_id = %invoice.invoice_id, "Invoice email sent");
                    updated
                }
                Err(e) => {
                    warn!(
                        invoice_id = %invoice.invoice_id,
                        error = %e,
                        "Invoice email sent but delivery counter update failed"
                    );
                    None
                }
            },
            Err(e) => {
                warn!(
                    invoice_id = %invoice.invoice_id,
                    error = %e,
                    "Invoice email delivery failed"
                );
                None
            }
        }
    }
}

fn invoice_email(invoice: &Invoice, to: String) -> EmailMessage {
    let amount = format!("{} {}", invoice.total, invoice.currency.to_uppercase());
    let due_line = invoice
        .due_date
        .map(|d| format!(" It is due by {}.", d))
        .unwrap_or_default();

    let body_text = format!(
        "Hi {},\n\nA new invoice for {} has been issued to you.{}\n\nThank you.",
        invoice.client_name, amount, due_line
    );
    let body_html = format!(
        "<p>Hi {},</p><p>A new invoice for <strong>{}</strong> has been issued to you.{}</p><p>Thank you.</p>",
        invoice.client_name, amount, due_line
    );

    EmailMessage {
        to,
        subject: format!("Invoice for {}", amount),
        body_text: Some(body_text),
        body_html: Some(body_html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_invoice(total: &str, due: Option<NaiveDate>) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            client_name: "Acme Corp".to_string(),
            client_email: Some("billing@acme.test".to_string()),
            status: "sent".to_string(),
            currency: "usd".to_string(),
            issue_date: None,
            due_date: due,
            subtotal: total.parse().unwrap(),
            tax_total: Decimal::ZERO,
            total: total.parse().unwrap(),
            recurring_invoice_id: None,
            sent_count: 0,
            document_ref: None,
            created_utc: chrono::Utc::now(),
            updated_utc: chrono::Utc::now(),
        }
    }

    #[test]
    fn invoice_email_includes_amount_and_due_date() {
        let due = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let invoice = sample_invoice("55.75", Some(due));
        let email = invoice_email(&invoice, "billing@acme.test".to_string());

        assert_eq!(email.to, "billing@acme.test");
        assert_eq!(email.subject, "Invoice for 55.75 USD");
        let text = email.body_text.unwrap();
        assert!(text.contains("55.75 USD"));
        assert!(text.contains("due by 2025-08-01"));
    }

    #[test]
    fn invoice_email_omits_due_date_when_absent() {
        let invoice = sample_invoice("10.00", None);
        let email = invoice_email(&invoice, "billing@acme.test".to_string());

        assert!(!email.body_text.unwrap().contains("due by"));
    }
}
