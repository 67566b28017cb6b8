//! Metrics module for billing-service.
//! Provides Prometheus metrics for invoice, payment and sweep operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoices created counter
pub static INVOICES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment status transitions counter
pub static PAYMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events counter by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recurring sweep per-schedule results counter
pub static SWEEP_SCHEDULES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice amount counter by currency (monetary tracking)
pub static INVOICE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    INVOICES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_invoices_total", "Total invoices created by status"),
            &["status"]
        )
        .expect("Failed to register INVOICES_TOTAL")
    });

    PAYMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payments_total",
                "Total payment status transitions"
            ),
            &["status"]
        )
        .expect("Failed to register PAYMENTS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_webhook_events_total",
                "Total provider webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    SWEEP_SCHEDULES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_sweep_schedules_total",
                "Recurring sweep per-schedule results"
            ),
            &["result"]
        )
        .expect("Failed to register SWEEP_SCHEDULES_TOTAL")
    });

    INVOICE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "billing_invoice_amount_total",
                "Total invoiced amount by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    service_core::middleware::init_http_metrics();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record an invoice creation.
pub fn record_invoice_created(status: &str) {
    if let Some(counter) = INVOICES_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record a payment status transition.
pub fn record_payment_status(status: &str) {
    if let Some(counter) = PAYMENTS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record a webhook event outcome.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

/// Record one schedule's sweep result.
pub fn record_sweep_schedule(result: &str) {
    if let Some(counter) = SWEEP_SCHEDULES_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record an invoiced amount for financial tracking.
pub fn record_invoice_amount(currency: &str, amount: f64) {
    if let Some(counter) = INVOICE_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}
