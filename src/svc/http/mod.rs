//! # HTTP module
//!
//! This module provides the inbound HTTP surface: the webhook endpoint, the
//! health probe and the telemetry exporter.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::{HeaderMap, Request, Response, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use serde_json::Value;

use crate::svc::{event::{dispatcher::Dispatcher, WebhookEvent}, source};

pub mod layer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

// -----------------------------------------------------------------------------
// Router

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook_root))
        .route("/webhook/*path", post(webhook_subpath));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics::handler));

    router
        .fallback(not_found)
        .layer(middleware::from_fn(layer::access))
        .with_state(dispatcher)
}

// -----------------------------------------------------------------------------
// Webhook handlers

async fn webhook_root(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> StatusCode {
    accept(dispatcher, "/", headers, payload).await
}

async fn webhook_subpath(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> StatusCode {
    accept(dispatcher, &path, headers, payload).await
}

/// wraps the payload and acknowledges once the event is enqueued, the
/// processors validate and apply it asynchronously
async fn accept(
    dispatcher: Arc<Dispatcher>,
    path: &str,
    headers: HeaderMap,
    payload: Value,
) -> StatusCode {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_lowercase(), value.to_string()))
        })
        .collect();

    let event = WebhookEvent::new(source::normalize_path(path), headers, payload);
    dispatcher.dispatch(event).await;

    StatusCode::OK
}

// -----------------------------------------------------------------------------
// Healthz

#[tracing::instrument(skip_all)]
pub async fn healthz() -> Response<Body> {
    let mut res = Response::default();

    let message = serde_json::json!({"status": "ok"}).to_string();

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(message);

    res
}

// -----------------------------------------------------------------------------
// Not found

#[tracing::instrument(skip_all)]
pub async fn not_found(_req: Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

// -----------------------------------------------------------------------------
// Tests
