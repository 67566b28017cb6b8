//! Email delivery for invoice and reconciliation notifications.

use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("Email delivery is not enabled")]
    NotEnabled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// An outbound email. At least one of the body variants must be present.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailerError>;
    fn is_enabled(&self) -> bool;
}

/// SMTP-backed mailer using STARTTLS.
pub struct SmtpMailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, MailerError> {
        let transport = if config.enabled {
            let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| {
                    MailerError::Configuration(format!("SMTP relay setup failed: {}", e))
                })?
                .port(config.port)
                .credentials(Credentials::new(
                    config.user.clone(),
                    config.password.expose_secret().clone(),
                ));
            Some(builder.build())
        } else {
            None
        };

        Ok(Self { transport, config })
    }

    fn from_mailbox(&self) -> Result<Mailbox, MailerError> {
        format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| MailerError::Configuration(format!("Invalid from address: {}", e)))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailerError> {
        let Some(transport) = &self.transport else {
            return Err(MailerError::NotEnabled);
        };

        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| MailerError::InvalidRecipient(format!("{}: {}", email.to, e)))?;

        let builder = Message::builder()
            .from(self.from_mailbox()?)
            .to(to)
            .subject(email.subject.clone());

        let message = match (&email.body_text, &email.body_html) {
            (Some(text), Some(html)) => builder
                .multipart(MultiPart::alternative_plain_html(
                    text.clone(),
                    html.clone(),
                ))
                .map_err(|e| MailerError::SendFailed(format!("Failed to build message: {}", e)))?,
            (Some(text), None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone())
                .map_err(|e| MailerError::SendFailed(format!("Failed to build message: {}", e)))?,
            (None, Some(html)) => builder
                .header(ContentType::TEXT_HTML)
                .body(html.clone())
                .map_err(|e| MailerError::SendFailed(format!("Failed to build message: {}", e)))?,
            (None, None) => {
                return Err(MailerError::SendFailed("Email has no body".to_string()));
            }
        };

        transport
            .send(message)
            .await
            .map_err(|e| MailerError::SendFailed(e.to_string()))?;

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }
}

/// Mock mailer for local development and tests. Logs what would have been
/// sent instead of talking SMTP.
pub struct MockMailer {
    enabled: bool,
    send_count: AtomicU64,
}

impl MockMailer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            send_count: AtomicU64::new(0),
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), MailerError> {
        if !self.enabled {
            return Err(MailerError::NotEnabled);
        }

        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            count = count,
            "[MOCK] Email would be sent"
        );
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
