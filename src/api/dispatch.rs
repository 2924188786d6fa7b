//! Dispatch ingress
//!
//! `POST /dispatch` accepts a JSON array of tasks and runs them through
//! the dispatcher concurrently. When the global pool is saturated the
//! sliding-window rate limiter gates callers with `429`.

use super::{bearer_token, require_auth};
use crate::middleware::RateLimiter;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tetora_core::dispatch::{Dispatcher, Task, TaskResult};
use tetora_core::TetoraConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Response body for `POST /dispatch`
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    /// One result per submitted task, in order
    pub tasks: Vec<TaskResult>,
}

/// Handle `POST /dispatch`
pub async fn dispatch_tasks(
    Extension(config): Extension<Arc<TetoraConfig>>,
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Extension(cancel): Extension<CancellationToken>,
    headers: HeaderMap,
    Json(mut tasks): Json<Vec<Task>>,
) -> Response {
    if let Err(status) = require_auth(&config, &headers) {
        return status.into_response();
    }

    // under saturation, rate-limit per caller identity
    if dispatcher.admission().saturated() {
        let key = bearer_token(&headers).unwrap_or("anonymous").to_string();
        let verdict = limiter.check(&key).await;
        if !verdict.allowed {
            debug!(key = %key, "dispatch rate limited");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", verdict.retry_after_secs.to_string())],
            )
                .into_response();
        }
    }

    for task in &mut tasks {
        task.ensure_id();
        if task.source.is_empty() {
            task.source = "http".to_string();
        }
    }

    let results = join_all(
        tasks
            .into_iter()
            .map(|task| dispatcher.dispatch(task, cancel.child_token())),
    )
    .await;

    Json(DispatchResponse { tasks: results }).into_response()
}
