//! # Layer module
//!
//! This module provides middlewares to give to the server implementation.

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next};
#[cfg(feature = "metrics")]
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::info;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static ACCESS_REQUEST: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_http_requests_count",
        "Number of inbound http requests",
        &["method", "path", "status"]
    )
    .expect("'ocean_http_requests_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static ACCESS_REQUEST_DURATION: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_http_requests_duration",
        "Cumulated duration of inbound http requests",
        &["method", "path", "status"]
    )
    .expect("'ocean_http_requests_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Access

#[tracing::instrument(skip_all)]
pub async fn access(req: Request<Body>, next: Next) -> axum::response::Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let begin = Instant::now();
    let res = next.run(req).await;
    let duration = begin.elapsed().as_micros();

    let status = res.status().as_u16();

    #[cfg(feature = "metrics")]
    ACCESS_REQUEST
        .with_label_values(&[&method, &path, &status.to_string()])
        .inc();

    #[cfg(feature = "metrics")]
    ACCESS_REQUEST_DURATION
        .with_label_values(&[&method, &path, &status.to_string()])
        .inc_by(duration as u64);

    info!(
        method = method,
        path = path,
        status = status,
        duration = format!("{duration}us"),
        "Request received"
    );

    res
}
