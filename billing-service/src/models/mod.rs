//! Domain models for billing-service.

mod invoice;
mod payment;
mod recurring;

pub use invoice::{
    CreateInvoice, Invoice, InvoiceItem, InvoiceStatus, LineItemInput, UpdateInvoice,
};
pub use payment::{refund_status, CreatePayment, Payment, PaymentStatus};
pub use recurring::{
    CreateRecurringInvoice, RecurringInvoice, RecurringStatus, SweepRun, SweepRunStatus,
};
