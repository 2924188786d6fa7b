//! Health and metrics endpoints

use axum::response::Json;
use serde::Serialize;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` when the process can answer
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /metrics` - Prometheus text exposition
pub async fn metrics() -> String {
    tetora_core::metrics::global::export_prometheus()
}
