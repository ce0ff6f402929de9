//! # Metrics module
//!
//! This module provides a handler to export telemetry using the prometheus
//! text format

use axum::{
    body::Body,
    http::{header, HeaderValue, Response, StatusCode},
};
use prometheus::{Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// handler

#[tracing::instrument(skip_all)]
pub async fn handler() -> Response<Body> {
    let mut res = Response::default();
    let headers = res.headers_mut();

    match encode() {
        Ok(buf) => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(mime::TEXT_PLAIN_UTF_8.as_ref())
                    .expect("constant to be iso8859-1 compliant"),
            );

            *res.status_mut() = StatusCode::OK;
            *res.body_mut() = Body::from(buf);
        }
        Err(err) => {
            let message = serde_json::json!({"error": err.to_string()}).to_string();

            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(mime::APPLICATION_JSON.as_ref())
                    .expect("constant to be iso8859-1 compliant"),
            );

            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *res.body_mut() = Body::from(message);
        }
    }

    res
}

// -----------------------------------------------------------------------------
// helpers

fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let mut buf = vec![];

    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(buf)
}
