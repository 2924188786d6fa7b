//! Server assembly
//!
//! Builds the shared application value (store, providers, admission,
//! dispatcher, cron, SLA) and runs the HTTP server with graceful drain.

use crate::api;
use crate::middleware::RateLimiter;
use anyhow::{Context, Result};
use std::sync::Arc;
use tetora_core::audit::AuditLog;
use tetora_core::cron::{parse_timezone, CronEngine};
use tetora_core::dispatch::Dispatcher;
use tetora_core::sla::SlaChecker;
use tetora_core::workflow::WorkflowEngine;
use tetora_core::{AdmissionController, ShutdownController, Store, TetoraConfig};
use tetora_llm::ProviderRegistry;
use tracing::info;

/// The assembled application: every process-wide singleton lives here and
/// is passed down explicitly.
pub struct App {
    /// Loaded configuration
    pub config: Arc<TetoraConfig>,
    /// Embedded database
    pub store: Store,
    /// Admission controller shared with the HTTP layer and drain
    pub admission: Arc<AdmissionController>,
    /// The dispatch engine
    pub dispatcher: Arc<Dispatcher>,
    /// Cron scheduling
    pub cron: Arc<CronEngine>,
    /// Workflow DAG execution
    pub workflows: Arc<WorkflowEngine>,
    /// Periodic SLA evaluation
    pub sla: Arc<SlaChecker>,
}

impl App {
    /// Initialize every subsystem from configuration
    ///
    /// # Errors
    /// Returns an error when the database, providers, or cron seeds fail
    /// to initialize.
    pub async fn init(config: TetoraConfig) -> Result<App> {
        let config = Arc::new(config);

        let db_path = config.storage.resolved_db_path();
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;

        let providers = Arc::new(
            ProviderRegistry::from_specs(&config.providers)
                .context("failed to build provider registry")?,
        );
        let admission = Arc::new(AdmissionController::new(config.concurrency.clone()));

        let audit_path = db_path
            .parent()
            .map(|dir| dir.join("audit.jsonl"))
            .unwrap_or_else(|| "audit.jsonl".into());
        let audit = AuditLog::new(audit_path);

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            store.clone(),
            providers,
            admission.clone(),
            audit,
        ));

        let timezone =
            parse_timezone(&config.cron.timezone).context("invalid cron timezone")?;
        let cron = Arc::new(
            CronEngine::new(dispatcher.clone(), timezone, &config.cron.jobs)
                .context("failed to seed cron jobs")?,
        );
        let workflows = Arc::new(WorkflowEngine::new(dispatcher.clone()));
        let sla = Arc::new(SlaChecker::new(store.clone(), config.sla.clone()));

        Ok(App {
            config,
            store,
            admission,
            dispatcher,
            cron,
            workflows,
            sla,
        })
    }
}

/// Run the server until interrupted
///
/// # Errors
/// Returns an error on bind failure or initialization failure.
pub async fn serve(config: TetoraConfig) -> Result<()> {
    let app = App::init(config).await?;
    app.store
        .health_check()
        .await
        .context("database health check failed")?;
    let shutdown = Arc::new(ShutdownController::new(app.admission.clone()));

    {
        let cron = app.cron.clone();
        let token = shutdown.token();
        tokio::spawn(async move { cron.run(token).await });
    }
    {
        let sla = app.sla.clone();
        let token = shutdown.token();
        tokio::spawn(async move { sla.run(token).await });
    }

    let limiter = Arc::new(RateLimiter::new(app.config.server.rate_limit.clone()));
    let router = api::router(&app, limiter, shutdown.token());

    let addr = format!("{}:{}", app.config.server.host, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "tetora listening");

    let drain_token = shutdown.token();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = drain_token.cancelled() => {}
            }
        })
        .await
        .context("server error")?;

    shutdown.shutdown().await;
    info!("tetora stopped");
    Ok(())
}
