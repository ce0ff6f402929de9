//! # Resync module
//!
//! This module provides the resync orchestrator: it fetches and compiles the
//! mapping document, runs one pipeline per kind concurrently, then
//! reconciles the catalog by deleting attributed entities the run no longer
//! produced. Every state transition is reported to the catalog.

use std::{
    collections::{BTreeSet, HashSet},
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::{future::join_all, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::svc::{
    catalog::{
        entity::{deletion_candidates, exceeds_threshold, Entity, EntityRef, SeenSet},
        CatalogClient, DeleteOpts, DeleteOutcome, StatusPatch, UpsertOpts,
    },
    context::RunContext,
    expr::Engine,
    mapping::{self, compiler::CompiledResource, PortAppConfig},
    source::{RawRecordSource, Registry},
    telemetry,
};

pub mod pipeline;

// -----------------------------------------------------------------------------
// RunState enumeration

/// the state machine of one resync run, reported to the catalog on each
/// transition
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RunState {
    Starting,
    FetchingConfig,
    KindsRunning,
    Deleting,
    Completed,
    Failed,
    Cancelled,
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::FetchingConfig => write!(f, "FETCHING_CONFIG"),
            Self::KindsRunning => write!(f, "KINDS_RUNNING"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// -----------------------------------------------------------------------------
// KindStatus enumeration

#[derive(Serialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum KindStatus {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

// -----------------------------------------------------------------------------
// KindOutcome structure

/// per-kind counters and final status of one resync run
#[derive(Serialize, Clone, Debug)]
pub struct KindOutcome {
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "status")]
    pub status: KindStatus,
    #[serde(rename = "recordsSeen")]
    pub records_seen: usize,
    #[serde(rename = "entitiesUpserted")]
    pub entities_upserted: usize,
    #[serde(rename = "entitiesFailed")]
    pub entities_failed: usize,
    #[serde(rename = "mappingErrors")]
    pub mapping_errors: usize,
    #[serde(rename = "entitiesDeleted")]
    pub entities_deleted: usize,
    #[serde(rename = "thresholdExceeded")]
    pub threshold_exceeded: bool,
    /// record total announced by the source, for progress reporting
    #[serde(rename = "totalHint", skip_serializing_if = "Option::is_none")]
    pub total_hint: Option<u64>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "blueprints")]
    pub blueprints: BTreeSet<String>,
    /// entities whose upsert failed while placeholder creation was
    /// disabled, replayed once at end of resync
    #[serde(skip)]
    pub deferred: Vec<Entity>,
}

impl KindOutcome {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status: KindStatus::Completed,
            records_seen: 0,
            entities_upserted: 0,
            entities_failed: 0,
            mapping_errors: 0,
            entities_deleted: 0,
            threshold_exceeded: false,
            total_hint: None,
            error: None,
            blueprints: BTreeSet::new(),
            deferred: vec![],
        }
    }
}

// -----------------------------------------------------------------------------
// Summary structure

/// the user-visible outcome of one resync run
#[derive(Clone, Debug)]
pub struct Summary {
    pub trace_id: String,
    pub status: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kinds: Vec<KindOutcome>,
}

impl Summary {
    pub fn records_seen(&self) -> usize {
        self.kinds.iter().map(|kind| kind.records_seen).sum()
    }

    pub fn entities_upserted(&self) -> usize {
        self.kinds.iter().map(|kind| kind.entities_upserted).sum()
    }

    pub fn entities_deleted(&self) -> usize {
        self.kinds.iter().map(|kind| kind.entities_deleted).sum()
    }

    pub fn mapping_errors(&self) -> usize {
        self.kinds.iter().map(|kind| kind.mapping_errors).sum()
    }

    pub fn threshold_exceeded(&self) -> bool {
        self.kinds.iter().any(|kind| kind.threshold_exceeded)
    }

    fn to_patch(&self) -> StatusPatch {
        StatusPatch {
            status: self.status.to_string(),
            trace_id: self.trace_id.to_owned(),
            started_at: Some(self.started_at),
            finished_at: Some(self.finished_at),
            summary: serde_json::to_value(&self.kinds).ok(),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load or compile mapping document, {0}")]
    Mapping(mapping::Error),
}

impl From<mapping::Error> for Error {
    fn from(err: mapping::Error) -> Self {
        Self::Mapping(err)
    }
}

// -----------------------------------------------------------------------------
// Resync structure

/// one full enumeration of the third party, reconciled into the catalog
pub struct Resync {
    catalog: Arc<dyn CatalogClient>,
    engine: Arc<dyn Engine>,
    registry: Arc<Registry>,
}

impl Resync {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        engine: Arc<dyn Engine>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            catalog,
            engine,
            registry,
        }
    }

    #[tracing::instrument(skip_all, fields(trace_id = ctx.trace_id))]
    pub async fn run(&self, ctx: &RunContext) -> Result<Summary, Error> {
        let started_at = Utc::now();

        info!(trace_id = ctx.trace_id, "Start resync run");
        self.report(ctx, RunState::Starting, started_at, None, None)
            .await;

        // ---------------------------------------------------------------------
        // Step 1: fetch and compile the mapping document

        self.report(ctx, RunState::FetchingConfig, started_at, None, None)
            .await;

        let app_config = match self.fetch_app_config(ctx).await {
            Ok(app_config) => app_config,
            Err(err) => {
                self.report(ctx, RunState::Failed, started_at, Some(Utc::now()), None)
                    .await;
                return Err(err);
            }
        };

        let resources = match mapping::compiler::compile(
            self.engine.as_ref(),
            &ctx.config,
            &app_config,
        ) {
            Ok(resources) => resources,
            Err(err) => {
                self.report(ctx, RunState::Failed, started_at, Some(Utc::now()), None)
                    .await;
                return Err(Error::from(err));
            }
        };

        // ---------------------------------------------------------------------
        // Step 2: run every configured kind concurrently

        self.report(ctx, RunState::KindsRunning, started_at, None, None)
            .await;

        let runs = self.plan(resources);
        let seen = Arc::new(SeenSet::new());
        let budget = Arc::new(Semaphore::new(ctx.config.max_concurrent_upserts));

        let mut outcomes = join_all(runs.iter().map(|(resource, source)| {
            pipeline::run_kind(
                ctx,
                self.catalog.to_owned(),
                resource.to_owned(),
                source.to_owned(),
                seen.to_owned(),
                budget.to_owned(),
            )
        }))
        .await;

        // ---------------------------------------------------------------------
        // Step 3: one replay pass for entities that failed on relation
        // targets produced by other kinds

        if !ctx.is_cancelled() {
            for (outcome, (resource, _)) in outcomes.iter_mut().zip(runs.iter()) {
                let deferred = std::mem::take(&mut outcome.deferred);
                if deferred.is_empty() {
                    continue;
                }

                self.replay_deferred(ctx, outcome, resource, &seen, deferred)
                    .await;
            }
        }

        // ---------------------------------------------------------------------
        // Step 4: delete phase, only for kinds that fully completed

        if !ctx.is_cancelled()
            && outcomes
                .iter()
                .any(|outcome| outcome.status == KindStatus::Completed)
        {
            self.report(ctx, RunState::Deleting, started_at, None, None)
                .await;

            // the candidate set is frozen now, live events racing the phase
            // are not recomputed
            let snapshot = seen.snapshot();

            for (outcome, (resource, _)) in outcomes.iter_mut().zip(runs.iter()) {
                if outcome.status != KindStatus::Completed || ctx.is_cancelled() {
                    continue;
                }

                self.delete_phase(ctx, outcome, resource, &snapshot).await;
            }
        }

        // ---------------------------------------------------------------------
        // Step 5: derive the run status and report the summary

        let status = if ctx.is_cancelled() {
            RunState::Cancelled
        } else if outcomes
            .iter()
            .any(|outcome| outcome.status == KindStatus::Failed)
        {
            RunState::Failed
        } else {
            RunState::Completed
        };

        telemetry::resync_run(&status.to_string());

        let summary = Summary {
            trace_id: ctx.trace_id.to_owned(),
            status,
            started_at,
            finished_at: Utc::now(),
            kinds: outcomes,
        };

        if let Err(err) = self
            .catalog
            .patch_integration(&ctx.config.integration.identifier, &summary.to_patch())
            .await
        {
            warn!(
                trace_id = ctx.trace_id,
                error = err.to_string(),
                "Failed to report resync summary to the catalog"
            );
        }

        info!(
            trace_id = ctx.trace_id,
            status = status.to_string(),
            records = summary.records_seen(),
            upserted = summary.entities_upserted(),
            deleted = summary.entities_deleted(),
            mapping_errors = summary.mapping_errors(),
            "Resync run finished"
        );

        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // helpers

    async fn fetch_app_config(&self, ctx: &RunContext) -> Result<PortAppConfig, Error> {
        mapping::load(self.catalog.as_ref(), &ctx.config)
            .await
            .map_err(|err| {
                warn!(
                    trace_id = ctx.trace_id,
                    error = err.to_string(),
                    "Failed to obtain a mapping document for the resync"
                );

                Error::Mapping(err)
            })
    }

    /// pairs each compiled resource with its registered source, in source
    /// registration order. Mismatches are reported and skipped
    fn plan(
        &self,
        resources: Vec<CompiledResource>,
    ) -> Vec<(Arc<CompiledResource>, Arc<dyn RawRecordSource>)> {
        let mut runs = vec![];

        for kind in self.registry.kinds() {
            let resource = resources.iter().find(|resource| resource.kind == kind);

            match (resource, self.registry.source(&kind)) {
                (Some(resource), Some(source)) => {
                    runs.push((Arc::new(resource.to_owned()), source));
                }
                (None, _) => {
                    warn!(
                        kind = kind,
                        "Kind has a registered source but no mapping, it is skipped"
                    );
                }
                (_, None) => {}
            }
        }

        for resource in &resources {
            if self.registry.source(&resource.kind).is_none() {
                warn!(
                    kind = resource.kind,
                    "Kind is mapped but has no registered source, it is skipped"
                );
            }
        }

        runs
    }

    /// replays entities whose per-entity upsert failed while placeholder
    /// creation was disabled. Every kind has upserted by now, so relation
    /// targets produced elsewhere in the resync exist
    async fn replay_deferred(
        &self,
        ctx: &RunContext,
        outcome: &mut KindOutcome,
        resource: &CompiledResource,
        seen: &SeenSet,
        deferred: Vec<Entity>,
    ) {
        info!(
            kind = outcome.kind,
            trace_id = ctx.trace_id,
            count = deferred.len(),
            "Replay entities that failed on missing relation targets"
        );

        let opts = UpsertOpts {
            create_missing_related_entities: resource.create_missing_related_entities,
            merge: true,
        };

        for (blueprint, group) in pipeline::group_by_blueprint(deferred) {
            for chunk in group.chunks(ctx.config.upsert_batch_size) {
                match self.catalog.upsert_entities(&blueprint, chunk, &opts).await {
                    Ok(result) => {
                        let recovered = result.upserted.len();

                        telemetry::entities_upserted(&outcome.kind, recovered);
                        outcome.entities_upserted += recovered;
                        outcome.entities_failed =
                            outcome.entities_failed.saturating_sub(recovered);
                        seen.record(result.upserted);
                    }
                    Err(err) => {
                        warn!(
                            kind = outcome.kind,
                            trace_id = ctx.trace_id,
                            blueprint = blueprint,
                            error = err.to_string(),
                            "Replay batch failed to upsert"
                        );
                    }
                }
            }
        }
    }

    async fn delete_phase(
        &self,
        ctx: &RunContext,
        outcome: &mut KindOutcome,
        resource: &CompiledResource,
        seen: &HashSet<EntityRef>,
    ) {
        let integration = &ctx.config.integration.identifier;

        let mut blueprints = outcome.blueprints.to_owned();
        if let Some(hint) = resource.blueprint_hint() {
            blueprints.insert(hint.to_string());
        }

        for blueprint in &blueprints {
            if ctx.is_cancelled() {
                return;
            }

            let catalog_set = match self.catalog.search_entities(integration, blueprint).await {
                Ok(catalog_set) => catalog_set,
                Err(err) => {
                    error!(
                        kind = outcome.kind,
                        trace_id = ctx.trace_id,
                        blueprint = blueprint,
                        error = err.to_string(),
                        "Failed to enumerate attributed entities, deletions are skipped"
                    );

                    outcome.error = Some(err.to_string());
                    continue;
                }
            };

            let candidates = deletion_candidates(&catalog_set, seen);
            if candidates.is_empty() {
                continue;
            }

            if exceeds_threshold(
                candidates.len(),
                catalog_set.len(),
                ctx.config.entity_deletion_threshold,
            ) {
                error!(
                    kind = outcome.kind,
                    trace_id = ctx.trace_id,
                    blueprint = blueprint,
                    candidates = candidates.len(),
                    total = catalog_set.len(),
                    threshold = ctx.config.entity_deletion_threshold,
                    "Deletion threshold exceeded, no entity is deleted"
                );

                outcome.threshold_exceeded = true;
                continue;
            }

            info!(
                kind = outcome.kind,
                trace_id = ctx.trace_id,
                blueprint = blueprint,
                count = candidates.len(),
                "Delete stale attributed entities"
            );

            let opts = DeleteOpts {
                delete_dependents: resource.delete_dependent_entities,
            };
            let deleted = AtomicUsize::new(0);

            futures::stream::iter(candidates)
                .for_each_concurrent(ctx.config.max_concurrent_upserts, |reference| {
                    let deleted = &deleted;
                    let opts = &opts;

                    async move {
                        if ctx.is_cancelled() {
                            return;
                        }

                        match self.catalog.delete_entity(&reference, opts).await {
                            Ok(DeleteOutcome::Deleted) => {
                                deleted.fetch_add(1, Ordering::SeqCst);
                            }
                            Ok(DeleteOutcome::NotFound) => {}
                            Err(err) => {
                                warn!(
                                    trace_id = ctx.trace_id,
                                    entity = reference.to_string(),
                                    error = err.to_string(),
                                    "Failed to delete stale entity"
                                );
                            }
                        }
                    }
                })
                .await;

            let deleted = deleted.load(Ordering::SeqCst);

            outcome.entities_deleted += deleted;
            telemetry::entities_deleted(&outcome.kind, deleted);
        }
    }

    async fn report(
        &self,
        ctx: &RunContext,
        status: RunState,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        summary: Option<serde_json::Value>,
    ) {
        let patch = StatusPatch {
            status: status.to_string(),
            trace_id: ctx.trace_id.to_owned(),
            started_at: Some(started_at),
            finished_at,
            summary,
        };

        if let Err(err) = self
            .catalog
            .patch_integration(&ctx.config.integration.identifier, &patch)
            .await
        {
            warn!(
                trace_id = ctx.trace_id,
                status = status.to_string(),
                error = err.to_string(),
                "Failed to report resync state to the catalog"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
