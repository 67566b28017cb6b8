//! HTTP handlers for billing-service.

pub mod health;
pub mod invoices;
pub mod recurring;
pub mod webhooks;
