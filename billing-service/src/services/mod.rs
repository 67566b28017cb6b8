//! Services module for billing-service.

pub mod database;
pub mod documents;
pub mod lifecycle;
pub mod mailer;
pub mod metrics;
pub mod reconciliation;
pub mod schedule;
pub mod stripe;
pub mod sweep;
pub mod totals;

pub use database::Database;
pub use documents::{DocumentError, DocumentStore, HttpDocumentStore, MockDocumentStore};
pub use lifecycle::InvoiceLifecycle;
pub use mailer::{EmailMessage, Mailer, MailerError, MockMailer, SmtpMailer};
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::ReconciliationEngine;
pub use schedule::{next_occurrence, RecurrenceInterval, ScheduleError};
pub use stripe::{StripeClient, StripeEvent};
pub use sweep::{RecurringSweeper, SweepFailure, SweepOutcome};
pub use totals::{item_amounts, price_invoice, ItemAmounts, PricedInvoice, PricedItem};
