//! # Dispatcher module
//!
//! This module fans inbound webhook events out to the processors registered
//! on their path. Each matching processor receives the event in its own
//! queue; across processors events run in parallel, within one queue they
//! are strictly ordered.

use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::svc::{
    catalog::{retry::Backoff, CatalogClient},
    cfg::Configuration,
    event::{queue, WebhookEvent},
    expr::Engine,
    source::{Registry, WebhookProcessor},
    telemetry,
};

// -----------------------------------------------------------------------------
// Dispatcher structure

/// routes events to processor queues, one queue per registered processor
pub struct Dispatcher {
    routes: HashMap<String, Vec<(Arc<dyn WebhookProcessor>, queue::Queue)>>,
}

impl Dispatcher {
    pub fn new(
        registry: &Registry,
        catalog: Arc<dyn CatalogClient>,
        engine: Arc<dyn Engine>,
        config: Arc<Configuration>,
        token: &CancellationToken,
    ) -> Self {
        let mut routes: HashMap<String, Vec<(Arc<dyn WebhookProcessor>, queue::Queue)>> =
            HashMap::new();

        for (path, _, processor) in registry.all_processors() {
            let attempts = processor
                .max_retries()
                .unwrap_or(config.event_max_retries)
                .saturating_add(1);

            let queue = queue::spawn(
                path.to_owned(),
                processor.to_owned(),
                catalog.to_owned(),
                engine.to_owned(),
                config.to_owned(),
                Backoff::with_attempts(attempts),
                token.child_token(),
            );

            routes.entry(path).or_default().push((processor, queue));
        }

        Self { routes }
    }

    /// enqueues the event with every matching processor on its path and
    /// returns how many queues accepted it. The HTTP layer acknowledges
    /// once this returns, processing is asynchronous
    pub async fn dispatch(&self, event: WebhookEvent) -> usize {
        let Some(route) = self.routes.get(&event.path) else {
            debug!(
                path = event.path,
                trace_id = event.trace_id,
                "No processor is registered on this path, event ignored"
            );
            return 0;
        };

        let mut enqueued = 0;

        for (processor, queue) in route {
            if !processor.should_process(&event).await {
                continue;
            }

            if queue.enqueue(event.to_owned()) {
                telemetry::event_enqueued(&event.path);
                enqueued += 1;
            }
        }

        info!(
            path = event.path,
            trace_id = event.trace_id,
            enqueued = enqueued,
            "Webhook event dispatched"
        );

        enqueued
    }

    /// closes every queue and waits for the workers to drain
    pub async fn shutdown(&self) {
        for route in self.routes.values() {
            for (_, queue) in route {
                queue.shutdown().await;
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
