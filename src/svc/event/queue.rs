//! # Queue module
//!
//! This module provides the per-processor event queue. Each processor owns
//! one unbounded FIFO queue drained by a single worker task, so events are
//! handled in strict arrival order. Failed handlers are retried in place
//! with backoff, which keeps the ordering guarantee intact.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::svc::{
    catalog::{
        retry::{self, Backoff},
        CatalogClient, DeleteOpts, DeleteOutcome, UpsertOpts,
    },
    cfg::Configuration,
    event::WebhookEvent,
    expr::Engine,
    mapping::{self, compiler},
    resync::pipeline::group_by_blueprint,
    source::{RawResults, WebhookProcessor},
    telemetry,
};

// -----------------------------------------------------------------------------
// Queue structure

/// the sending half of one processor queue and its worker task
pub struct Queue {
    path: String,
    tx: Mutex<Option<mpsc::UnboundedSender<WebhookEvent>>>,
    depth: Arc<AtomicUsize>,
    high_watermark: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    /// enqueues an event for this processor, returns false once the worker
    /// is gone
    pub fn enqueue(&self, event: WebhookEvent) -> bool {
        let guard = self.tx.lock().expect("queue lock to not be poisoned");
        let Some(tx) = guard.as_ref() else {
            return false;
        };

        if tx.send(event).is_err() {
            return false;
        }

        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        telemetry::queue_depth(&self.path, depth);

        if depth > self.high_watermark {
            warn!(
                path = self.path,
                depth = depth,
                high_watermark = self.high_watermark,
                "Processor queue is backing up"
            );
        }

        true
    }

    /// closes the queue and waits for the worker to drain it
    pub async fn shutdown(&self) {
        self.tx
            .lock()
            .expect("queue lock to not be poisoned")
            .take();

        let worker = self
            .worker
            .lock()
            .expect("queue lock to not be poisoned")
            .take();

        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(
                    path = self.path,
                    error = err.to_string(),
                    "Failed to join queue worker"
                );
            }
        }
    }
}

// -----------------------------------------------------------------------------
// spawn

/// starts the worker task of one processor queue
pub fn spawn(
    path: String,
    processor: Arc<dyn WebhookProcessor>,
    catalog: Arc<dyn CatalogClient>,
    engine: Arc<dyn Engine>,
    config: Arc<Configuration>,
    policy: Backoff,
    token: CancellationToken,
) -> Queue {
    let (tx, mut rx) = mpsc::unbounded_channel::<WebhookEvent>();
    let depth = Arc::new(AtomicUsize::new(0));

    let worker = tokio::spawn({
        let path = path.to_owned();
        let depth = depth.to_owned();
        let config = config.clone();

        async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                depth.fetch_sub(1, Ordering::SeqCst);
                telemetry::queue_depth(&path, depth.load(Ordering::SeqCst));

                process(
                    &path,
                    processor.as_ref(),
                    catalog.as_ref(),
                    engine.as_ref(),
                    &config,
                    &policy,
                    &event,
                )
                .await;
            }

            debug!(path = path, "Queue worker stopped");
        }
    });

    Queue {
        path,
        tx: Mutex::new(Some(tx)),
        depth,
        high_watermark: config.event_queue_high_watermark,
        worker: Mutex::new(Some(worker)),
    }
}

// -----------------------------------------------------------------------------
// helpers

async fn process(
    path: &str,
    processor: &dyn WebhookProcessor,
    catalog: &dyn CatalogClient,
    engine: &dyn Engine,
    config: &Configuration,
    policy: &Backoff,
    event: &WebhookEvent,
) {
    if !processor.authenticate(&event.payload, &event.headers).await {
        warn!(
            path = path,
            trace_id = event.trace_id,
            "Webhook event failed authentication, dropped"
        );
        telemetry::event_processed(path, "unauthenticated");
        return;
    }

    if !processor.validate_payload(&event.payload).await {
        warn!(
            path = path,
            trace_id = event.trace_id,
            "Webhook event failed payload validation, dropped"
        );
        telemetry::event_processed(path, "invalid");
        return;
    }

    // the mapping document is fetched once per event
    let app_config = match mapping::load(catalog, config).await {
        Ok(app_config) => app_config,
        Err(err) => {
            error!(
                path = path,
                trace_id = event.trace_id,
                error = err.to_string(),
                "Failed to obtain a mapping document for the event, dropped"
            );
            telemetry::event_processed(path, "failed");
            return;
        }
    };

    let mut failed = false;

    for kind in processor.matching_kinds(event).await {
        let resource = match app_config.resource(&kind) {
            Some(resource) => resource,
            None => {
                warn!(
                    path = path,
                    trace_id = event.trace_id,
                    kind = kind,
                    "Event matched a kind absent from the mapping document"
                );
                continue;
            }
        };

        let compiled = match compiler::compile_resource(engine, config, &app_config, resource) {
            Ok(compiled) => compiled,
            Err(err) => {
                error!(
                    path = path,
                    trace_id = event.trace_id,
                    kind = kind,
                    error = err.to_string(),
                    "Failed to compile mapping for the event"
                );
                failed = true;
                continue;
            }
        };

        let results = match retry::with_backoff(policy, || processor.handle(event, resource)).await
        {
            Ok(results) => results,
            Err(err) => {
                error!(
                    path = path,
                    trace_id = event.trace_id,
                    kind = kind,
                    error = err.to_string(),
                    "Processor exhausted its retry budget, event dropped for this kind"
                );
                failed = true;
                continue;
            }
        };

        apply(catalog, config, &compiled, &kind, results, event).await;
    }

    telemetry::event_processed(path, if failed { "failed" } else { "processed" });
}

/// applies one event's results to the catalog, upserts before deletions
async fn apply(
    catalog: &dyn CatalogClient,
    config: &Configuration,
    compiled: &compiler::CompiledResource,
    kind: &str,
    results: RawResults,
    event: &WebhookEvent,
) {
    let updated = compiled.map_batch(&results.updated);

    telemetry::mapping_errors(kind, updated.errors.len());
    for err in &updated.errors {
        warn!(
            trace_id = event.trace_id,
            kind = kind,
            error = err.to_string(),
            "Updated record failed to map"
        );
    }

    let opts = UpsertOpts {
        create_missing_related_entities: compiled.create_missing_related_entities,
        merge: true,
    };

    for (blueprint, group) in group_by_blueprint(updated.entities) {
        for chunk in group.chunks(config.upsert_batch_size) {
            match catalog.upsert_entities(&blueprint, chunk, &opts).await {
                Ok(outcome) => {
                    telemetry::entities_upserted(kind, outcome.upserted.len());
                    telemetry::entities_failed(kind, outcome.failed.len());

                    for failed in outcome.failed {
                        warn!(
                            trace_id = event.trace_id,
                            entity = failed.reference.to_string(),
                            error = failed.message,
                            "Entity failed to upsert from event"
                        );
                    }
                }
                Err(err) => {
                    telemetry::entities_failed(kind, chunk.len());
                    error!(
                        trace_id = event.trace_id,
                        blueprint = blueprint,
                        error = err.to_string(),
                        "Event batch failed to upsert"
                    );
                }
            }
        }
    }

    // records reported as deleted still flow through the mapping, the
    // produced identifiers drive the deletions
    let deleted = compiled.map_batch(&results.deleted);

    telemetry::mapping_errors(kind, deleted.errors.len());
    for err in &deleted.errors {
        warn!(
            trace_id = event.trace_id,
            kind = kind,
            error = err.to_string(),
            "Deleted record failed to map"
        );
    }

    let opts = DeleteOpts {
        delete_dependents: compiled.delete_dependent_entities,
    };

    for entity in deleted.entities {
        match catalog.delete_entity(&entity.reference(), &opts).await {
            Ok(DeleteOutcome::Deleted) => {
                telemetry::entities_deleted(kind, 1);
                info!(
                    trace_id = event.trace_id,
                    entity = entity.reference().to_string(),
                    "Entity deleted from event"
                );
            }
            Ok(DeleteOutcome::NotFound) => {}
            Err(err) => {
                warn!(
                    trace_id = event.trace_id,
                    entity = entity.reference().to_string(),
                    error = err.to_string(),
                    "Failed to delete entity from event"
                );
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::spawn;
    use crate::svc::{
        catalog::{memory::MemoryCatalog, retry::Backoff},
        cfg::tests_support::configuration,
        event::WebhookEvent,
        expr::filter::FilterEngine,
        mapping::PortAppConfig,
        source::{self, RawResults, WebhookProcessor},
    };

    fn app_config() -> PortAppConfig {
        serde_yaml::from_str(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .issue.id
          blueprint: '"jiraIssue"'
"#,
        )
        .expect("mapping document to parse")
    }

    fn fast_policy(attempts: u32) -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            attempts,
            jitter: 0.0,
        }
    }

    fn event(payload: serde_json::Value) -> WebhookEvent {
        WebhookEvent::new("/", BTreeMap::new(), payload)
    }

    struct FlakyProcessor {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl WebhookProcessor for FlakyProcessor {
        async fn matching_kinds(&self, _event: &WebhookEvent) -> Vec<String> {
            vec!["issue".to_string()]
        }

        async fn handle(
            &self,
            event: &WebhookEvent,
            _resource: &crate::svc::mapping::ResourceConfig,
        ) -> Result<RawResults, source::Error> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);

            if attempt < self.fail_first {
                return Err(source::Error::message("third party flaked"));
            }

            Ok(RawResults {
                updated: vec![event.payload.to_owned()],
                deleted: vec![],
            })
        }
    }

    #[tokio::test]
    async fn transient_handler_failures_are_retried_in_place() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));
        let calls = Arc::new(AtomicU32::new(0));

        let queue = spawn(
            "/".to_string(),
            Arc::new(FlakyProcessor {
                calls: calls.to_owned(),
                fail_first: 2,
            }),
            catalog.to_owned(),
            Arc::new(FilterEngine),
            Arc::new(configuration()),
            fast_policy(4),
            CancellationToken::new(),
        );

        assert!(queue.enqueue(event(json!({"issue": {"id": "A"}}))));
        queue.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(catalog.snapshot().entities.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_event() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));
        let calls = Arc::new(AtomicU32::new(0));

        let queue = spawn(
            "/".to_string(),
            Arc::new(FlakyProcessor {
                calls: calls.to_owned(),
                fail_first: u32::MAX,
            }),
            catalog.to_owned(),
            Arc::new(FilterEngine),
            Arc::new(configuration()),
            fast_policy(3),
            CancellationToken::new(),
        );

        assert!(queue.enqueue(event(json!({"issue": {"id": "A"}}))));
        queue.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(catalog.snapshot().entities.is_empty());
    }

    struct RejectingProcessor;

    #[async_trait]
    impl WebhookProcessor for RejectingProcessor {
        async fn authenticate(
            &self,
            _payload: &serde_json::Value,
            _headers: &BTreeMap<String, String>,
        ) -> bool {
            false
        }

        async fn matching_kinds(&self, _event: &WebhookEvent) -> Vec<String> {
            vec!["issue".to_string()]
        }

        async fn handle(
            &self,
            _event: &WebhookEvent,
            _resource: &crate::svc::mapping::ResourceConfig,
        ) -> Result<RawResults, source::Error> {
            panic!("an unauthenticated event must not reach the handler");
        }
    }

    #[tokio::test]
    async fn unauthenticated_events_never_reach_the_handler() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));

        let queue = spawn(
            "/".to_string(),
            Arc::new(RejectingProcessor),
            catalog.to_owned(),
            Arc::new(FilterEngine),
            Arc::new(configuration()),
            fast_policy(1),
            CancellationToken::new(),
        );

        assert!(queue.enqueue(event(json!({"issue": {"id": "A"}}))));
        queue.shutdown().await;

        assert!(catalog.snapshot().entities.is_empty());
    }
}
