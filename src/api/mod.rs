//! HTTP API
//!
//! JSON-in/JSON-out endpoints over axum. Authentication is a bearer token
//! compared against `server.api_token`; when no token is configured the
//! API is open (local single-user deployments).

pub mod cron;
pub mod dispatch;
pub mod health;
pub mod history;

use crate::middleware::RateLimiter;
use crate::server::App;
use axum::extract::Extension;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tetora_core::TetoraConfig;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Uniform JSON envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Whether the call succeeded
    pub success: bool,
    /// Payload on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error text on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// A success envelope
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// An error envelope
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Extract the bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Enforce the configured API token; no-op when none is set
pub fn require_auth(config: &TetoraConfig, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = config
        .server
        .api_token
        .as_deref()
        .filter(|token| !token.is_empty())
    else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Assemble the router with all shared state attached
pub fn router(app: &App, limiter: Arc<RateLimiter>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch::dispatch_tasks))
        .route("/metrics", get(health::metrics))
        .route("/health", get(health::health))
        .route("/history", get(history::list_runs))
        .route("/history/stats/daily", get(history::daily_stats))
        .route("/cron", get(cron::list_jobs).post(cron::create_job))
        .route(
            "/cron/:id",
            get(cron::get_job)
                .put(cron::update_job)
                .delete(cron::delete_job),
        )
        .route("/cron/:id/toggle", post(cron::toggle_job))
        .route("/cron/:id/approve", post(cron::approve_job))
        .route("/cron/:id/reject", post(cron::reject_job))
        .route("/cron/:id/run", post(cron::run_job))
        .layer(Extension(app.config.clone()))
        .layer(Extension(app.dispatcher.clone()))
        .layer(Extension(app.cron.clone()))
        .layer(Extension(limiter))
        .layer(Extension(cancel))
        .layer(TraceLayer::new_for_http())
}
