//! Cron management endpoints

use super::{require_auth, ApiResponse};
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tetora_core::cron::{CronEngine, CronJobSpec};
use tetora_core::dispatch::TaskResult;
use tetora_core::Error;
use tetora_core::TetoraConfig;
use tokio_util::sync::CancellationToken;

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(ApiResponse::<()>::error(err.to_string()))).into_response()
}

/// `GET /cron`
pub async fn list_jobs(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    Json(ApiResponse::success(engine.list().await)).into_response()
}

/// `POST /cron` - jobs created over the API start pending approval
pub async fn create_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Json(spec): Json<CronJobSpec>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.add(spec.clone(), true).await {
        Ok(()) => match engine.get(&spec.id).await {
            Ok(view) => Json(ApiResponse::success(view)).into_response(),
            Err(err) => error_response(&err),
        },
        Err(err) => error_response(&err),
    }
}

/// `GET /cron/:id`
pub async fn get_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.get(&id).await {
        Ok(view) => Json(ApiResponse::success(view)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `PUT /cron/:id`
pub async fn update_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(spec): Json<CronJobSpec>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.update(&id, spec).await {
        Ok(()) => match engine.get(&id).await {
            Ok(view) => Json(ApiResponse::success(view)).into_response(),
            Err(err) => error_response(&err),
        },
        Err(err) => error_response(&err),
    }
}

/// `DELETE /cron/:id`
pub async fn delete_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.remove(&id).await {
        Ok(()) => Json(ApiResponse::success(id)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /cron/:id/toggle`
pub async fn toggle_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.toggle(&id).await {
        Ok(enabled) => Json(ApiResponse::success(enabled)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /cron/:id/approve`
pub async fn approve_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.approve(&id).await {
        Ok(()) => Json(ApiResponse::success(id)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /cron/:id/reject`
pub async fn reject_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.reject(&id).await {
        Ok(()) => Json(ApiResponse::success(id)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /cron/:id/run` - fire a job immediately
pub async fn run_job(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(engine): Extension<Arc<CronEngine>>,
    Extension(cancel): Extension<CancellationToken>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }
    match engine.run_now(&id, cancel.child_token()).await {
        Ok(result) => Json(ApiResponse::<TaskResult>::success(result)).into_response(),
        Err(err) => error_response(&err),
    }
}
