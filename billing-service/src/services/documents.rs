//! Invoice document rendering through the document service.

use crate::config::DocumentsConfig;
use crate::models::{Invoice, InvoiceItem};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document rendering is not enabled")]
    NotEnabled,

    #[error("Render request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid render response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Render a document for the invoice and return its stored reference.
    async fn render_invoice(
        &self,
        invoice: &Invoice,
        items: &[InvoiceItem],
    ) -> Result<String, DocumentError>;

    fn is_enabled(&self) -> bool;
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    invoice: &'a Invoice,
    items: &'a [InvoiceItem],
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    document_id: String,
}

/// Renders invoice documents through the document service's HTTP API.
pub struct HttpDocumentStore {
    client: Client,
    config: DocumentsConfig,
}

impl HttpDocumentStore {
    pub fn new(config: DocumentsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn render_invoice(
        &self,
        invoice: &Invoice,
        items: &[InvoiceItem],
    ) -> Result<String, DocumentError> {
        if !self.config.enabled {
            return Err(DocumentError::NotEnabled);
        }

        let response = self
            .client
            .post(format!("{}/documents/invoice", self.config.url))
            .json(&RenderRequest { invoice, items })
            .send()
            .await
            .map_err(|e| DocumentError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DocumentError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(DocumentError::RequestFailed(format!(
                "Document service returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let rendered: RenderResponse =
            serde_json::from_str(&body).map_err(|e| DocumentError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            invoice_id = %invoice.invoice_id,
            document_id = %rendered.document_id,
            "Invoice document rendered"
        );
        Ok(rendered.document_id)
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Mock document store for local development and tests.
pub struct MockDocumentStore {
    enabled: bool,
    render_count: AtomicU64,
}

impl MockDocumentStore {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            render_count: AtomicU64::new(0),
        }
    }

    pub fn render_count(&self) -> u64 {
        self.render_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn render_invoice(
        &self,
        invoice: &Invoice,
        _items: &[InvoiceItem],
    ) -> Result<String, DocumentError> {
        if !self.enabled {
            return Err(DocumentError::NotEnabled);
        }

        let count = self.render_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            invoice_id = %invoice.invoice_id,
            count = count,
            "[MOCK] Invoice document would be rendered"
        );
        Ok(format!("mock-document-{}", count))
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn test_invoice() -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            client_name: "Acme Corp".to_string(),
            client_email: None,
            status: "sent".to_string(),
            currency: "usd".to_string(),
            issue_date: None,
            due_date: None,
            subtotal: Decimal::ZERO,
            tax_total: Decimal::ZERO,
            total: Decimal::ZERO,
            recurring_invoice_id: None,
            sent_count: 0,
            document_ref: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mock_store_counts_renders_and_returns_distinct_refs() {
        let store = MockDocumentStore::new(true);
        let first = store.render_invoice(&test_invoice(), &[]).await.unwrap();
        let second = store.render_invoice(&test_invoice(), &[]).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(store.render_count(), 2);
    }

    #[tokio::test]
    async fn disabled_mock_store_rejects_renders() {
        let store = MockDocumentStore::new(false);
        let err = store.render_invoice(&test_invoice(), &[]).await.unwrap_err();
        assert!(matches!(err, DocumentError::NotEnabled));
        assert_eq!(store.render_count(), 0);
    }
}
