//! # Server module
//!
//! This module provides the HTTP server exposing the webhook endpoint, the
//! health probe and the telemetry exporter

use std::{net::AddrParseError, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::svc::{cfg::Configuration, event::dispatcher::Dispatcher, http::router};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to bind server, {0}")]
    Bind(std::io::Error),
    #[error("failed to serve content, {0}")]
    Serve(std::io::Error),
}

// -----------------------------------------------------------------------------
// serve

/// serves until the given token is cancelled, then shuts down gracefully
#[tracing::instrument(skip_all)]
pub async fn serve(
    config: Arc<Configuration>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
) -> Result<(), Error> {
    let addr: std::net::SocketAddr = config
        .listen
        .parse()
        .map_err(|err| Error::Listen(config.listen.to_owned(), err))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Bind)?;

    info!("Start to listen for http requests on {}", addr);
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(Error::Serve)
}
