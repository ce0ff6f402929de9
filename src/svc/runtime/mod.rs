//! # Runtime module
//!
//! This module provides the root object integration binaries hand control
//! to. The builder replaces decorator-style registration: user code
//! registers per-kind sources, webhook processors and startup hooks, then
//! the runtime registers the integration with the catalog, brings up the
//! webhook endpoint and drives resyncs according to the configured listener
//! mode.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::svc::{
    catalog::{
        client::{self, PortClient},
        CatalogClient, IntegrationSpec,
    },
    cfg::{Configuration, EventListenerKind},
    context::RunContext,
    event::dispatcher::Dispatcher,
    expr::{filter::FilterEngine, Engine},
    http::server,
    resync::Resync,
    source::{RawRecordSource, Registry, WebhookProcessor},
};

// -----------------------------------------------------------------------------
// Constants

/// bounded wait for in-flight work during graceful shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// types

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type StartHook = Box<dyn FnOnce(Arc<Configuration>) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with the catalog, {0}")]
    Client(client::Error),
    #[error("failed to serve http endpoint, {0}")]
    Server(server::Error),
    #[error("failed to execute startup hook, {0}")]
    Start(BoxError),
    #[error("event listener '{0}' requires an external consumer, it is not available in this build")]
    UnsupportedListener(&'static str),
    #[error("failed to listen for termination signal, {0}")]
    Signal(std::io::Error),
}

impl From<client::Error> for Error {
    fn from(err: client::Error) -> Self {
        Self::Client(err)
    }
}

impl From<server::Error> for Error {
    fn from(err: server::Error) -> Self {
        Self::Server(err)
    }
}

// -----------------------------------------------------------------------------
// Builder structure

pub struct Builder {
    config: Arc<Configuration>,
    registry: Registry,
    catalog: Option<Arc<dyn CatalogClient>>,
    engine: Option<Arc<dyn Engine>>,
    on_start: Vec<StartHook>,
}

impl Builder {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self {
            config,
            registry: Registry::new(),
            catalog: None,
            engine: None,
            on_start: vec![],
        }
    }

    /// registers the batch producer for one resource kind
    pub fn register_resync(
        mut self,
        kind: impl Into<String>,
        source: Arc<dyn RawRecordSource>,
    ) -> Self {
        self.registry.register_resync(kind, source);
        self
    }

    /// registers a webhook processor on a sub-path of the webhook endpoint
    pub fn register_webhook_processor(
        mut self,
        path: impl AsRef<str>,
        processor: Arc<dyn WebhookProcessor>,
    ) -> Self {
        self.registry.register_webhook_processor(path, processor);
        self
    }

    /// registers a hook executed before anything else at startup, used by
    /// integrations to install default blueprints and mappings
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Arc<Configuration>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_start
            .push(Box::new(move |config| Box::pin(hook(config))));
        self
    }

    /// overrides the catalog client, tests plug an in-memory one
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogClient>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// overrides the expression engine
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(PortClient::try_from(&self.config)?),
        };

        Ok(Runtime {
            config: self.config,
            registry: Arc::new(self.registry),
            catalog,
            engine: self.engine.unwrap_or_else(|| Arc::new(FilterEngine)),
            on_start: self.on_start,
            root: CancellationToken::new(),
        })
    }
}

// -----------------------------------------------------------------------------
// Controller structure

/// enforces the at-most-one-resync invariant. Triggering while a run is
/// active cancels it and waits for its full teardown before starting anew
pub struct Controller {
    resync: Arc<Resync>,
    config: Arc<Configuration>,
    active: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Controller {
    pub fn new(resync: Arc<Resync>, config: Arc<Configuration>) -> Self {
        Self {
            resync,
            config,
            active: None,
        }
    }

    pub async fn trigger(&mut self, root: &CancellationToken) {
        if let Some((token, handle)) = self.active.take() {
            if !handle.is_finished() {
                info!("Cancel the active resync before starting a new one");
            }

            token.cancel();
            if let Err(err) = handle.await {
                warn!(
                    error = err.to_string(),
                    "Failed to join the previous resync run"
                );
            }
        }

        let token = root.child_token();
        let ctx = RunContext::with_token(self.config.to_owned(), token.to_owned());
        let resync = self.resync.to_owned();

        let handle = tokio::spawn(async move {
            if let Err(err) = resync.run(&ctx).await {
                error!(
                    trace_id = ctx.trace_id,
                    error = err.to_string(),
                    "Resync run failed"
                );
            }
        });

        self.active = Some((token, handle));
    }

    /// waits for the active run to finish without cancelling it
    pub async fn join(&mut self) {
        if let Some((_, handle)) = self.active.take() {
            if let Err(err) = handle.await {
                warn!(error = err.to_string(), "Failed to join the resync run");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Runtime structure

pub struct Runtime {
    config: Arc<Configuration>,
    registry: Arc<Registry>,
    catalog: Arc<dyn CatalogClient>,
    engine: Arc<dyn Engine>,
    on_start: Vec<StartHook>,
    root: CancellationToken,
}

impl Runtime {
    pub fn builder(config: Arc<Configuration>) -> Builder {
        Builder::new(config)
    }

    /// the root cancellation token, cancelling it shuts the runtime down
    pub fn cancellation(&self) -> CancellationToken {
        self.root.to_owned()
    }

    /// runs the startup sequence then serves until the listener mode
    /// completes or a termination signal arrives
    pub async fn run(mut self) -> Result<(), Error> {
        let listener = self.config.event_listener.kind;

        // KAFKA consumes a pub/sub transport owned by an external
        // collaborator, refuse it before touching the catalog
        if listener == EventListenerKind::Kafka {
            return Err(Error::UnsupportedListener("KAFKA"));
        }

        // ---------------------------------------------------------------------
        // Step 1: startup hooks

        for hook in std::mem::take(&mut self.on_start) {
            hook(self.config.to_owned()).await.map_err(Error::Start)?;
        }

        // ---------------------------------------------------------------------
        // Step 2: register the integration with the catalog

        let spec = IntegrationSpec {
            identifier: self.config.integration.identifier.to_owned(),
            kind: self.config.integration.kind.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: hostname::get()
                .ok()
                .and_then(|host| host.into_string().ok()),
        };

        self.catalog.register_integration(&spec).await?;

        // ---------------------------------------------------------------------
        // Step 3: bring up the webhook endpoint

        let dispatcher = Arc::new(Dispatcher::new(
            self.registry.as_ref(),
            self.catalog.to_owned(),
            self.engine.to_owned(),
            self.config.to_owned(),
            &self.root,
        ));

        let server = tokio::spawn(server::serve(
            self.config.to_owned(),
            dispatcher.to_owned(),
            self.root.child_token(),
        ));

        // ---------------------------------------------------------------------
        // Step 4: drive resyncs according to the listener mode

        let mut controller = Controller::new(
            Arc::new(Resync::new(
                self.catalog.to_owned(),
                self.engine.to_owned(),
                self.registry.to_owned(),
            )),
            self.config.to_owned(),
        );

        let result = match listener {
            EventListenerKind::Once => {
                info!("Event listener is ONCE, running a single resync");
                controller.trigger(&self.root).await;
                controller.join().await;
                Ok(())
            }
            EventListenerKind::WebhooksOnly => {
                info!("Event listener is WEBHOOKS_ONLY, no resync is scheduled");
                shutdown_signal().await.map_err(Error::Signal)
            }
            EventListenerKind::Polling => {
                controller.trigger(&self.root).await;
                self.poll(&mut controller).await
            }
            EventListenerKind::Kafka => unreachable!("rejected at startup"),
        };

        // ---------------------------------------------------------------------
        // Step 5: graceful teardown

        self.root.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            controller.join().await;
            dispatcher.shutdown().await;
        })
        .await
        .is_err()
        {
            warn!(
                grace = format!("{}s", SHUTDOWN_GRACE.as_secs()),
                "Shutdown grace elapsed with work still in flight"
            );
        }

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(Error::Server(err)),
            Err(err) => warn!(error = err.to_string(), "Failed to join the http server"),
        }

        info!("Runtime halted");
        result
    }

    /// periodically cancels and restarts the resync until a termination
    /// signal arrives
    async fn poll(&self, controller: &mut Controller) -> Result<(), Error> {
        let Some(every) = self.config.resync_interval() else {
            info!("No scheduled resync interval, waiting for webhook events only");
            return shutdown_signal().await.map_err(Error::Signal);
        };

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately, the initial resync already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                signal = shutdown_signal() => return signal.map_err(Error::Signal),
                _ = ticker.tick() => {
                    info!("Scheduled resync interval elapsed");
                    controller.trigger(&self.root).await;
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// helpers

async fn shutdown_signal() -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::{Controller, Runtime};
    use crate::svc::{
        catalog::memory::MemoryCatalog,
        cfg::{tests_support::configuration, EventListenerKind},
        context::RunContext,
        expr::filter::FilterEngine,
        mapping::PortAppConfig,
        resync::Resync,
        source::{self, from_batches, BatchIterator, RawRecord, RawRecordSource, Registry},
    };

    fn app_config() -> PortAppConfig {
        serde_yaml::from_str(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"jiraIssue"'
"#,
        )
        .expect("mapping document to parse")
    }

    // -------------------------------------------------------------------------
    // A source journaling produce and close calls

    struct JournalingSource {
        journal: Arc<Mutex<Vec<String>>>,
        batches: usize,
    }

    #[async_trait]
    impl RawRecordSource for JournalingSource {
        async fn produce(
            &self,
            _ctx: &RunContext,
        ) -> Result<Box<dyn BatchIterator>, source::Error> {
            let run = {
                let mut journal = self.journal.lock().expect("journal lock");
                let run = journal.iter().filter(|entry| entry.starts_with("produce")).count();
                journal.push(format!("produce-{run}"));
                run
            };

            Ok(Box::new(JournalingIterator {
                journal: self.journal.to_owned(),
                run,
                remaining: self.batches,
            }))
        }
    }

    struct JournalingIterator {
        journal: Arc<Mutex<Vec<String>>>,
        run: usize,
        remaining: usize,
    }

    #[async_trait]
    impl BatchIterator for JournalingIterator {
        async fn next(&mut self) -> Result<Option<Vec<RawRecord>>, source::Error> {
            if self.remaining == 0 {
                return Ok(None);
            }

            self.remaining -= 1;
            // slow batches keep the run active while a new trigger arrives
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(Some(vec![json!({"id": format!("{}", self.remaining)})]))
        }

        async fn close(&mut self) {
            self.journal
                .lock()
                .expect("journal lock")
                .push(format!("close-{}", self.run));
        }
    }

    // -------------------------------------------------------------------------
    // Scenarios

    #[tokio::test]
    async fn once_mode_runs_the_startup_sequence_and_one_resync() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));

        let mut config = configuration();
        config.event_listener.kind = EventListenerKind::Once;
        config.listen = "127.0.0.1:0".to_string();

        let started = Arc::new(Mutex::new(false));
        let flag = started.to_owned();

        let runtime = Runtime::builder(Arc::new(config))
            .with_catalog(catalog.to_owned())
            .on_start(move |_config| async move {
                *flag.lock().expect("flag lock") = true;
                Ok(())
            })
            .register_resync(
                "issue",
                from_batches(vec![vec![json!({"id": "A"}), json!({"id": "B"})]]),
            )
            .build()
            .expect("runtime to build");

        runtime.run().await.expect("runtime to run");

        assert!(*started.lock().expect("flag lock"), "startup hook did not run");

        let state = catalog.snapshot();
        assert_eq!(state.registrations.len(), 1);
        assert_eq!(state.registrations[0].identifier, "jira-test");
        assert_eq!(state.entities.len(), 2);
        assert_eq!(
            state.patches.last().expect("final patch").status,
            "COMPLETED"
        );
    }

    #[tokio::test]
    async fn kafka_listener_is_rejected_at_startup() {
        let mut config = configuration();
        config.event_listener.kind = EventListenerKind::Kafka;

        let runtime = Runtime::builder(Arc::new(config))
            .with_catalog(Arc::new(MemoryCatalog::new()))
            .build()
            .expect("runtime to build");

        assert!(matches!(
            runtime.run().await,
            Err(super::Error::UnsupportedListener("KAFKA"))
        ));
    }

    #[tokio::test]
    async fn new_trigger_cancels_the_active_run_and_waits_for_teardown() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));
        let journal = Arc::new(Mutex::new(vec![]));

        let mut registry = Registry::new();
        registry.register_resync(
            "issue",
            Arc::new(JournalingSource {
                journal: journal.to_owned(),
                batches: 50,
            }),
        );

        let config = Arc::new(configuration());
        let resync = Arc::new(Resync::new(
            catalog.to_owned(),
            Arc::new(FilterEngine),
            Arc::new(registry),
        ));

        let root = tokio_util::sync::CancellationToken::new();
        let mut controller = Controller::new(resync, config);

        controller.trigger(&root).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        controller.trigger(&root).await;
        controller.join().await;

        // the first run closed its source before the second one produced
        let journal = journal.lock().expect("journal lock").to_owned();
        let close_first = journal.iter().position(|entry| entry == "close-0");
        let produce_second = journal.iter().position(|entry| entry == "produce-1");

        assert!(close_first.is_some(), "first run never closed its source");
        assert!(produce_second.is_some(), "second run never started");
        assert!(close_first < produce_second, "teardown overlapped the new run");

        // the cancelled run reported CANCELLED, the second completed
        let statuses: Vec<_> = catalog
            .snapshot()
            .patches
            .iter()
            .map(|patch| patch.status.to_owned())
            .collect();

        assert!(statuses.contains(&"CANCELLED".to_string()));
        assert_eq!(statuses.last(), Some(&"COMPLETED".to_string()));
    }

    #[tokio::test]
    async fn at_most_one_resync_is_active() {
        let catalog = Arc::new(MemoryCatalog::new().with_app_config(app_config()));
        let journal = Arc::new(Mutex::new(vec![]));

        let mut registry = Registry::new();
        registry.register_resync(
            "issue",
            Arc::new(JournalingSource {
                journal: journal.to_owned(),
                batches: 3,
            }),
        );

        let config = Arc::new(configuration());
        let resync = Arc::new(Resync::new(
            catalog.to_owned(),
            Arc::new(FilterEngine),
            Arc::new(registry),
        ));

        let root = tokio_util::sync::CancellationToken::new();
        let mut controller = Controller::new(resync, config);

        for _ in 0..3 {
            controller.trigger(&root).await;
        }
        controller.join().await;

        // every produce is preceded by the close of the previous run
        let journal = journal.lock().expect("journal lock").to_owned();
        let mut open = 0usize;

        for entry in &journal {
            if entry.starts_with("produce") {
                open += 1;
                assert_eq!(open, 1, "two sources were open at once: {journal:?}");
            } else if entry.starts_with("close") {
                open -= 1;
            }
        }
    }
}
