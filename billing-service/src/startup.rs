//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers::health::{health_check, metrics_handler, readiness_check};
use crate::handlers::{invoices, recurring, webhooks};
use crate::services::{
    init_metrics, Database, DocumentStore, HttpDocumentStore, InvoiceLifecycle, Mailer,
    ReconciliationEngine, RecurringSweeper, SmtpMailer, StripeClient,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub db: Arc<Database>,
    pub stripe: StripeClient,
    pub lifecycle: InvoiceLifecycle,
    pub reconciliation: ReconciliationEngine,
    pub sweeper: RecurringSweeper,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let mailer: Arc<dyn Mailer> = Arc::new(
            SmtpMailer::new(config.smtp.clone())
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?,
        );
        let documents: Arc<dyn DocumentStore> =
            Arc::new(HttpDocumentStore::new(config.documents.clone()));
        let stripe = StripeClient::new(config.stripe.clone());

        let lifecycle = InvoiceLifecycle::new(db.clone(), mailer.clone(), documents);
        let reconciliation = ReconciliationEngine::new(
            db.clone(),
            stripe.clone(),
            lifecycle.clone(),
            mailer,
            config.notifications.admin_email.clone(),
        );
        let sweeper = RecurringSweeper::new(db.clone(), lifecycle.clone());

        let state = AppState {
            config: config.clone(),
            db,
            stripe,
            lifecycle,
            reconciliation,
            sweeper,
        };

        // Bind HTTP listener
        let addr = config.common.bind_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .route("/invoices", post(invoices::create_invoice))
            .route(
                "/invoices/:invoice_id",
                get(invoices::get_invoice).put(invoices::update_invoice),
            )
            .route(
                "/invoices/:invoice_id/payments",
                get(invoices::list_invoice_payments),
            )
            .route(
                "/invoices/:invoice_id/checkout",
                post(invoices::create_checkout),
            )
            .route("/recurring", post(recurring::create_recurring))
            .route("/recurring/sweep", post(recurring::run_sweep))
            .route(
                "/recurring/:recurring_invoice_id",
                get(recurring::get_recurring),
            )
            .route(
                "/recurring/:recurring_invoice_id/activate",
                post(recurring::activate_recurring),
            )
            .route(
                "/recurring/:recurring_invoice_id/pause",
                post(recurring::pause_recurring),
            )
            .route(
                "/recurring/:recurring_invoice_id/cancel",
                post(recurring::cancel_recurring),
            )
            .route("/webhooks/stripe", post(webhooks::stripe_webhook))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state);

        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        if let Err(e) = axum::serve(self.listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }

        Ok(())
    }
}
