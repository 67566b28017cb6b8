//! Payment reconciliation engine.
//!
//! Translates provider webhook events into payment row mutations and keeps
//! the owning invoice's paid state in step. Providers deliver at least once
//! and out of order, so every branch writes absolute state: succeeded, failed
//! and canceled are plain idempotent sets, and refunds re-fetch the charge's
//! cumulative total instead of applying event deltas. Events that reference
//! nothing we know are logged and acknowledged so the provider stops
//! retrying them.

use crate::models::{Invoice, Payment};
use crate::services::database::Database;
use crate::services::lifecycle::InvoiceLifecycle;
use crate::services::mailer::{EmailMessage, Mailer};
use crate::services::metrics::{record_payment_status, record_webhook_event};
use crate::services::stripe::{
    from_minor_units, Charge, CheckoutSession, METADATA_PAYMENT_ID, PaymentIntent, Refund,
    StripeClient, StripeEvent,
};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: Arc<Database>,
    stripe: StripeClient,
    lifecycle: InvoiceLifecycle,
    mailer: Arc<dyn Mailer>,
    admin_email: Option<String>,
}

impl ReconciliationEngine {
    pub fn new(
        db: Arc<Database>,
        stripe: StripeClient,
        lifecycle: InvoiceLifecycle,
        mailer: Arc<dyn Mailer>,
        admin_email: Option<String>,
    ) -> Self {
        Self {
            db,
            stripe,
            lifecycle,
            mailer,
            admin_email,
        }
    }

    /// Apply one verified webhook event.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn process_event(&self, event: &StripeEvent) -> Result<(), AppError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_session_completed(event).await,
            "payment_intent.succeeded" => self.handle_intent_succeeded(event).await,
            "payment_intent.payment_failed" => self.handle_intent_failed(event).await,
            "payment_intent.canceled" => self.handle_intent_canceled(event).await,
            "checkout.session.async_payment_failed" => {
                self.handle_session_async_failed(event).await
            }
            "checkout.session.expired" => self.handle_session_expired(event).await,
            "charge.refunded" | "refund.updated" | "charge.refund.updated" => {
                self.handle_refund(event).await
            }
            other => {
                debug!(event_type = %other, "Unhandled webhook event type");
                record_webhook_event(other, "ignored");
                Ok(())
            }
        }
    }

    /// Checkout completion carries the payment intent and customer ids we did
    /// not know at initiation. Settlement itself arrives separately as
    /// `payment_intent.succeeded`.
    async fn handle_session_completed(&self, event: &StripeEvent) -> Result<(), AppError> {
        let session: CheckoutSession = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_session_payment(&session).await? else {
            self.drop_unmatched(event, &session.id);
            return Ok(());
        };

        let updated = self
            .db
            .attach_checkout_result(
                payment.payment_id,
                session.payment_intent.as_deref(),
                session.customer.as_deref(),
            )
            .await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &session.id);
                Ok(())
            }
        }
    }

    async fn handle_intent_succeeded(&self, event: &StripeEvent) -> Result<(), AppError> {
        let intent: PaymentIntent = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_intent_payment(&intent).await? else {
            self.drop_unmatched(event, &intent.id);
            return Ok(());
        };

        let (charge_id, balance_transaction_id) = intent.settled_charge();
        let updated = self
            .db
            .mark_payment_succeeded(
                payment.payment_id,
                charge_id.as_deref(),
                balance_transaction_id.as_deref(),
            )
            .await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &intent.id);
                Ok(())
            }
        }
    }

    async fn handle_intent_failed(&self, event: &StripeEvent) -> Result<(), AppError> {
        let intent: PaymentIntent = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_intent_payment(&intent).await? else {
            self.drop_unmatched(event, &intent.id);
            return Ok(());
        };

        let reason = failure_reason(&intent);
        let updated = self
            .db
            .mark_payment_failed(payment.payment_id, &reason)
            .await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &intent.id);
                Ok(())
            }
        }
    }

    async fn handle_intent_canceled(&self, event: &StripeEvent) -> Result<(), AppError> {
        let intent: PaymentIntent = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_intent_payment(&intent).await? else {
            self.drop_unmatched(event, &intent.id);
            return Ok(());
        };

        let updated = self.db.mark_payment_canceled(payment.payment_id).await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &intent.id);
                Ok(())
            }
        }
    }

    async fn handle_session_async_failed(&self, event: &StripeEvent) -> Result<(), AppError> {
        let session: CheckoutSession = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_session_payment(&session).await? else {
            self.drop_unmatched(event, &session.id);
            return Ok(());
        };

        let updated = self
            .db
            .mark_payment_failed(payment.payment_id, "Asynchronous payment failed")
            .await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &session.id);
                Ok(())
            }
        }
    }

    async fn handle_session_expired(&self, event: &StripeEvent) -> Result<(), AppError> {
        let session: CheckoutSession = event.object().map_err(AppError::BadRequest)?;
        let Some(payment) = self.resolve_session_payment(&session).await? else {
            self.drop_unmatched(event, &session.id);
            return Ok(());
        };

        let updated = self.db.mark_payment_canceled(payment.payment_id).await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &session.id);
                Ok(())
            }
        }
    }

    /// Refund events are cumulative per charge, and redeliveries or stale
    /// snapshots may carry old totals. The event only tells us which charge
    /// moved; the authoritative `amount_refunded` is re-fetched from the
    /// provider. A failed re-fetch surfaces as a provider error so the
    /// delivery is retried rather than reconciled from stale data.
    async fn handle_refund(&self, event: &StripeEvent) -> Result<(), AppError> {
        let (charge_id, payment_intent_id, metadata) = if event.event_type == "charge.refunded" {
            let charge: Charge = event.object().map_err(AppError::BadRequest)?;
            (Some(charge.id), charge.payment_intent, charge.metadata)
        } else {
            let refund: Refund = event.object().map_err(AppError::BadRequest)?;
            (refund.charge, refund.payment_intent, refund.metadata)
        };

        let payment = self
            .resolve_refund_payment(charge_id.as_deref(), payment_intent_id.as_deref(), &metadata)
            .await?;
        let Some(payment) = payment else {
            self.drop_unmatched(event, charge_id.as_deref().unwrap_or("<no charge>"));
            return Ok(());
        };

        let Some(charge_to_fetch) = charge_id.or_else(|| payment.charge_id.clone()) else {
            warn!(
                event_id = %event.id,
                payment_id = %payment.payment_id,
                "Refund event resolved to a payment with no charge reference, dropping"
            );
            record_webhook_event(&event.event_type, "dropped");
            return Ok(());
        };

        let charge = self
            .stripe
            .fetch_charge(&charge_to_fetch)
            .await
            .map_err(AppError::ProviderError)?;
        let authoritative_refunded = from_minor_units(charge.amount_refunded);

        let updated = self
            .db
            .apply_refund(payment.payment_id, authoritative_refunded)
            .await?;
        match updated {
            Some(payment) => self.finish_mutation(event, &payment).await,
            None => {
                self.drop_unmatched(event, &charge_to_fetch);
                Ok(())
            }
        }
    }

    async fn resolve_session_payment(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<Payment>, AppError> {
        if let Some(payment) = self.db.get_payment_by_session(&session.id).await? {
            return Ok(Some(payment));
        }
        self.resolve_by_metadata(&session.metadata).await
    }

    async fn resolve_intent_payment(
        &self,
        intent: &PaymentIntent,
    ) -> Result<Option<Payment>, AppError> {
        if let Some(payment) = self.db.get_payment_by_intent(&intent.id).await? {
            return Ok(Some(payment));
        }
        self.resolve_by_metadata(&intent.metadata).await
    }

    async fn resolve_refund_payment(
        &self,
        charge_id: Option<&str>,
        payment_intent_id: Option<&str>,
        metadata: &HashMap<String, String>,
    ) -> Result<Option<Payment>, AppError> {
        if let Some(charge_id) = charge_id {
            if let Some(payment) = self.db.get_payment_by_charge(charge_id).await? {
                return Ok(Some(payment));
            }
        }
        if let Some(intent_id) = payment_intent_id {
            if let Some(payment) = self.db.get_payment_by_intent(intent_id).await? {
                return Ok(Some(payment));
            }
        }
        self.resolve_by_metadata(metadata).await
    }

    async fn resolve_by_metadata(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<Option<Payment>, AppError> {
        let Some(raw) = metadata.get(METADATA_PAYMENT_ID) else {
            return Ok(None);
        };
        let Ok(payment_id) = Uuid::parse_str(raw) else {
            warn!(payment_id = %raw, "Webhook metadata carries an unparseable payment id");
            return Ok(None);
        };
        self.db.get_payment(payment_id).await
    }

    /// Post-mutation bookkeeping: recompute the owning invoice's paid state,
    /// then notify the admin. The recompute is load-bearing and propagates
    /// errors; the email is best-effort.
    async fn finish_mutation(&self, event: &StripeEvent, payment: &Payment) -> Result<(), AppError> {
        record_payment_status(&payment.status);

        let invoice = self
            .lifecycle
            .recompute_payment_status(payment.invoice_id)
            .await?;

        self.send_admin_summary(event, payment, invoice.as_ref()).await;
        record_webhook_event(&event.event_type, "processed");
        Ok(())
    }

    fn drop_unmatched(&self, event: &StripeEvent, reference: &str) {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            reference = %reference,
            "Webhook event matched no payment, dropping"
        );
        record_webhook_event(&event.event_type, "dropped");
    }

    async fn send_admin_summary(
        &self,
        event: &StripeEvent,
        payment: &Payment,
        invoice: Option<&Invoice>,
    ) {
        let Some(admin_email) = self.admin_email.clone() else {
            return;
        };
        if !self.mailer.is_enabled() {
            return;
        }

        let email = admin_summary_email(admin_email, event, payment, invoice);
        if let Err(e) = self.mailer.send(&email).await {
            warn!(
                event_id = %event.id,
                error = %e,
                "Admin payment summary email failed"
            );
        }
    }
}

fn failure_reason(intent: &PaymentIntent) -> String {
    intent
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| "Payment failed".to_string())
}

fn admin_summary_email(
    to: String,
    event: &StripeEvent,
    payment: &Payment,
    invoice: Option<&Invoice>,
) -> EmailMessage {
    let mut lines = vec![
        format!("Event: {} ({})", event.event_type, event.id),
        format!("Payment: {} [{}]", payment.payment_id, payment.status),
        format!("Invoice: {}", payment.invoice_id),
        format!(
            "Amount: {} {} (refunded {})",
            payment.amount,
            payment.currency.to_uppercase(),
            payment.refunded_amount
        ),
    ];
    if let Some(intent_id) = &payment.payment_intent_id {
        lines.push(format!("Payment intent: {}", intent_id));
    }
    if let Some(charge_id) = &payment.charge_id {
        lines.push(format!("Charge: {}", charge_id));
    }
    if let Some(invoice) = invoice {
        lines.push(format!("Invoice status: {}", invoice.status));
    }

    EmailMessage {
        to,
        subject: format!("Payment update: {}", event.event_type),
        body_text: Some(lines.join("\n")),
        body_html: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stripe::EventData;
    use rust_decimal::Decimal;

    fn sample_payment(status: &str) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            provider: "stripe".to_string(),
            checkout_session_id: Some("cs_1".to_string()),
            payment_intent_id: Some("pi_1".to_string()),
            charge_id: Some("ch_1".to_string()),
            balance_transaction_id: None,
            customer_id: None,
            status: status.to_string(),
            amount: "100.00".parse().unwrap(),
            refunded_amount: Decimal::ZERO,
            currency: "usd".to_string(),
            paid_utc: None,
            last_error: None,
            created_utc: chrono::Utc::now(),
            updated_utc: chrono::Utc::now(),
        }
    }

    #[test]
    fn failure_reason_prefers_provider_message() {
        let intent: PaymentIntent = serde_json::from_str(
            r#"{
                "id": "pi_1",
                "last_payment_error": {"code": "card_declined", "message": "Your card was declined."}
            }"#,
        )
        .unwrap();
        assert_eq!(failure_reason(&intent), "Your card was declined.");
    }

    #[test]
    fn failure_reason_falls_back_to_generic_message() {
        let intent: PaymentIntent = serde_json::from_str(r#"{"id": "pi_1"}"#).unwrap();
        assert_eq!(failure_reason(&intent), "Payment failed");
    }

    #[test]
    fn admin_summary_carries_event_and_record_identifiers() {
        let event = StripeEvent {
            id: "evt_42".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            data: EventData {
                object: serde_json::json!({}),
            },
        };
        let payment = sample_payment("succeeded");

        let email = admin_summary_email("admin@billing.test".to_string(), &event, &payment, None);

        assert_eq!(email.to, "admin@billing.test");
        assert_eq!(email.subject, "Payment update: payment_intent.succeeded");
        let body = email.body_text.unwrap();
        assert!(body.contains("evt_42"));
        assert!(body.contains(&payment.payment_id.to_string()));
        assert!(body.contains(&payment.invoice_id.to_string()));
        assert!(body.contains("pi_1"));
        assert!(body.contains("ch_1"));
    }
}
