//! History read endpoints

use super::{require_auth, ApiResponse};
use axum::extract::{Extension, Query};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tetora_core::dispatch::Dispatcher;
use tetora_core::store::RunFilter;
use tetora_core::TetoraConfig;

/// `GET /history`
pub async fn list_runs(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    headers: HeaderMap,
    Query(filter): Query<RunFilter>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match dispatcher.store().list_runs(&filter).await {
        Ok(runs) => Json(ApiResponse::success(runs)).into_response(),
        Err(err) => Json(ApiResponse::<()>::error(err.to_string())).into_response(),
    }
}

/// Query parameters for daily stats
#[derive(Debug, Deserialize)]
pub struct DailyStatsQuery {
    /// Days to cover (default 30)
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    30
}

/// `GET /history/stats/daily`
pub async fn daily_stats(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    headers: HeaderMap,
    Query(query): Query<DailyStatsQuery>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match dispatcher.store().daily_stats(query.days).await {
        Ok(stats) => Json(ApiResponse::success(stats)).into_response(),
        Err(err) => Json(ApiResponse::<()>::error(err.to_string())).into_response(),
    }
}
