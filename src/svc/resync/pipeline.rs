//! # Pipeline module
//!
//! This module provides the per-kind resync pipeline: a bounded prefetch of
//! source batches, parallel mapping workers, seen-set aggregation and
//! batched, budget-bounded upserts. Mapping failures are contained per
//! record; a source failure aborts the kind and forbids its delete phase.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::svc::{
    catalog::{
        entity::{Entity, SeenSet},
        CatalogClient, UpsertOpts,
    },
    context::RunContext,
    mapping::compiler::{CompiledResource, MappingOutput},
    resync::{KindOutcome, KindStatus},
    source::{self, RawRecord, RawRecordSource},
    telemetry,
};

// -----------------------------------------------------------------------------
// Constants

/// batches buffered between the source and the mapping stage
pub const SOURCE_PREFETCH: usize = 2;

// -----------------------------------------------------------------------------
// Tally structure

/// counters shared by the concurrent upsert tasks of one kind
#[derive(Default)]
struct Tally {
    upserted: AtomicUsize,
    failed: AtomicUsize,
    blueprints: Mutex<BTreeSet<String>>,
    /// entities whose per-entity upsert failed, replayed once at end of kind
    /// when placeholder creation is disabled
    retry_pool: Mutex<Vec<Entity>>,
}

impl Tally {
    fn observe_blueprint(&self, blueprint: &str) {
        self.blueprints
            .lock()
            .expect("tally lock to not be poisoned")
            .insert(blueprint.to_string());
    }
}

// -----------------------------------------------------------------------------
// run_kind

/// drives one kind from its source to the catalog and returns its outcome.
/// The delete phase is not part of the pipeline, it runs at end of resync
pub async fn run_kind(
    ctx: &RunContext,
    catalog: Arc<dyn CatalogClient>,
    resource: Arc<CompiledResource>,
    source: Arc<dyn RawRecordSource>,
    seen: Arc<SeenSet>,
    budget: Arc<Semaphore>,
) -> KindOutcome {
    let kind = resource.kind.to_owned();
    let begin = Instant::now();

    let mut outcome = KindOutcome::new(&kind);
    let tally = Arc::new(Tally::default());

    let iterator = match source.produce(ctx).await {
        Ok(iterator) => iterator,
        Err(err) => {
            error!(
                kind = kind,
                trace_id = ctx.trace_id,
                error = err.to_string(),
                "Failed to start source for kind"
            );

            outcome.status = KindStatus::Failed;
            outcome.error = Some(err.to_string());
            return outcome;
        }
    };

    if let Some(total) = iterator.total_hint() {
        outcome.total_hint = Some(total);
        info!(
            kind = kind,
            trace_id = ctx.trace_id,
            total = total,
            "Source announced a record total"
        );
    }

    // ---------------------------------------------------------------------
    // Stage 1: bounded prefetch of source batches

    let (batch_tx, batch_rx) = mpsc::channel::<Result<Vec<RawRecord>, source::Error>>(SOURCE_PREFETCH);
    let prefetch = tokio::spawn({
        let token = ctx.cancellation().to_owned();
        let mut iterator = iterator;

        async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = iterator.next() => next,
                };

                match next {
                    Ok(Some(batch)) => {
                        if batch_tx.send(Ok(batch)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = batch_tx.send(Err(err)).await;
                        break;
                    }
                }
            }

            iterator.close().await;
        }
    });

    // ---------------------------------------------------------------------
    // Stage 2: mapping workers, CPU bound, batch order preserved

    let workers = ctx.config.mapping_workers();
    let batches = futures::stream::unfold(batch_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    let mut mapped = Box::pin(
        batches
            .map(|result| {
                let resource = resource.to_owned();

                async move {
                    match result {
                        Ok(batch) => {
                            let records = batch.len();

                            tokio::task::spawn_blocking(move || resource.map_batch(&batch))
                                .await
                                .map(|output| (records, output))
                                .map_err(|err| {
                                    source::Error::Message(format!("mapping worker failed, {err}"))
                                })
                        }
                        Err(err) => Err(err),
                    }
                }
            })
            .buffered(workers),
    );

    // ---------------------------------------------------------------------
    // Stage 3: batched upserts bounded by the shared budget

    let mut handles = vec![];
    let mut source_error: Option<source::Error> = None;

    while let Some(item) = mapped.next().await {
        if ctx.is_cancelled() {
            break;
        }

        let (records, output) = match item {
            Ok(mapped) => mapped,
            Err(err) => {
                source_error = Some(err);
                break;
            }
        };

        outcome.records_seen += records;
        telemetry::records_seen(&kind, records);

        let MappingOutput { entities, errors } = output;

        outcome.mapping_errors += errors.len();
        telemetry::mapping_errors(&kind, errors.len());
        for err in &errors {
            warn!(
                kind = kind,
                trace_id = ctx.trace_id,
                error = err.to_string(),
                "Record failed to map"
            );
        }

        for (blueprint, group) in group_by_blueprint(entities) {
            tally.observe_blueprint(&blueprint);

            for chunk in group.chunks(ctx.config.upsert_batch_size) {
                let permit = match budget.to_owned().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                handles.push(tokio::spawn(upsert_chunk(
                    ctx.to_owned(),
                    catalog.to_owned(),
                    resource.to_owned(),
                    blueprint.to_owned(),
                    chunk.to_vec(),
                    seen.to_owned(),
                    tally.to_owned(),
                    permit,
                )));
            }
        }
    }

    // release the prefetch stage and wait for the source close hook to run
    drop(mapped);
    if let Err(err) = prefetch.await {
        warn!(
            kind = kind,
            trace_id = ctx.trace_id,
            error = err.to_string(),
            "Failed to join source prefetch task"
        );
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!(
                kind = kind,
                trace_id = ctx.trace_id,
                error = err.to_string(),
                "Failed to join upsert task"
            );
        }
    }

    // entities that failed on missing relation targets are replayed by the
    // orchestrator once every kind completed
    outcome.deferred = std::mem::take(
        &mut *tally
            .retry_pool
            .lock()
            .expect("tally lock to not be poisoned"),
    );

    outcome.entities_upserted = tally.upserted.load(Ordering::SeqCst);
    outcome.entities_failed = tally.failed.load(Ordering::SeqCst);
    outcome.blueprints = tally
        .blueprints
        .lock()
        .expect("tally lock to not be poisoned")
        .to_owned();

    outcome.status = if ctx.is_cancelled() {
        KindStatus::Cancelled
    } else if let Some(err) = source_error {
        error!(
            kind = kind,
            trace_id = ctx.trace_id,
            error = err.to_string(),
            "Source failed, the delete phase is disabled for this kind"
        );

        outcome.error = Some(err.to_string());
        KindStatus::Failed
    } else {
        KindStatus::Completed
    };

    telemetry::kind_duration(&kind, begin.elapsed());
    debug!(
        kind = kind,
        trace_id = ctx.trace_id,
        records = outcome.records_seen,
        upserted = outcome.entities_upserted,
        failed = outcome.entities_failed,
        mapping_errors = outcome.mapping_errors,
        "Kind pipeline finished"
    );

    outcome
}

// -----------------------------------------------------------------------------
// helpers

#[allow(clippy::too_many_arguments)]
async fn upsert_chunk(
    ctx: RunContext,
    catalog: Arc<dyn CatalogClient>,
    resource: Arc<CompiledResource>,
    blueprint: String,
    entities: Vec<Entity>,
    seen: Arc<SeenSet>,
    tally: Arc<Tally>,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let opts = UpsertOpts {
        create_missing_related_entities: resource.create_missing_related_entities,
        merge: true,
    };

    match catalog.upsert_entities(&blueprint, &entities, &opts).await {
        Ok(outcome) => {
            telemetry::entities_upserted(&resource.kind, outcome.upserted.len());
            tally.upserted.fetch_add(outcome.upserted.len(), Ordering::SeqCst);
            seen.record(outcome.upserted);

            if !outcome.failed.is_empty() {
                telemetry::entities_failed(&resource.kind, outcome.failed.len());
                tally.failed.fetch_add(outcome.failed.len(), Ordering::SeqCst);

                let mut pool = tally
                    .retry_pool
                    .lock()
                    .expect("tally lock to not be poisoned");

                for failed in outcome.failed {
                    warn!(
                        kind = resource.kind,
                        trace_id = ctx.trace_id,
                        entity = failed.reference.to_string(),
                        error = failed.message,
                        "Entity failed to upsert"
                    );

                    if !resource.create_missing_related_entities {
                        if let Some(entity) = entities
                            .iter()
                            .find(|entity| entity.reference() == failed.reference)
                        {
                            pool.push(entity.to_owned());
                        }
                    }
                }
            }
        }
        Err(err) => {
            telemetry::entities_failed(&resource.kind, entities.len());
            tally.failed.fetch_add(entities.len(), Ordering::SeqCst);

            error!(
                kind = resource.kind,
                trace_id = ctx.trace_id,
                blueprint = blueprint,
                count = entities.len(),
                error = err.to_string(),
                "Batch failed to upsert"
            );
        }
    }

    drop(permit);
}

/// groups entities by blueprint, preserving the mapped order inside each
/// group
pub(crate) fn group_by_blueprint(entities: Vec<Entity>) -> Vec<(String, Vec<Entity>)> {
    let mut groups: Vec<(String, Vec<Entity>)> = vec![];

    for entity in entities {
        match groups
            .iter_mut()
            .find(|(blueprint, _)| *blueprint == entity.blueprint)
        {
            Some((_, group)) => group.push(entity),
            None => groups.push((entity.blueprint.to_owned(), vec![entity])),
        }
    }

    groups
}

// -----------------------------------------------------------------------------
// Tests
