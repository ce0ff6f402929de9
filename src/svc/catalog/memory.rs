//! # Memory module
//!
//! This module provides an in-memory catalog used by the pipeline, event and
//! runtime tests. It records every operation in arrival order and supports
//! scripted failures.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::svc::{
    catalog::{
        client::Error,
        entity::{Entity, EntityRef},
        Blueprint, BulkUpsert, CatalogClient, DeleteOpts, DeleteOutcome, FailedUpsert,
        IntegrationSpec, StatusPatch, UpsertOpts,
    },
    mapping::PortAppConfig,
};

// -----------------------------------------------------------------------------
// Operation enumeration

/// one catalog write, logged in arrival order
#[derive(PartialEq, Clone, Debug)]
pub enum Operation {
    Upsert(EntityRef),
    Delete(EntityRef),
}

// -----------------------------------------------------------------------------
// State structure

#[derive(Default, Clone, Debug)]
pub struct State {
    pub app_config: Option<PortAppConfig>,
    pub entities: BTreeMap<EntityRef, Entity>,
    pub operations: Vec<Operation>,
    pub patches: Vec<StatusPatch>,
    pub registrations: Vec<IntegrationSpec>,
    pub upsert_calls: Vec<(String, usize)>,
    /// identifiers whose next upsert fails per-entity, consumed on hit
    pub failing_identifiers: BTreeSet<String>,
    pub fail_searches: bool,
}

// -----------------------------------------------------------------------------
// MemoryCatalog structure

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_config(self, app_config: PortAppConfig) -> Self {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .app_config = Some(app_config);

        self
    }

    /// pre-populates attributed entities, as if written by an earlier resync
    pub fn seed(&self, references: impl IntoIterator<Item = EntityRef>) {
        let mut state = self
            .state
            .lock()
            .expect("memory catalog lock to not be poisoned");

        for reference in references {
            let entity = Entity {
                identifier: reference.identifier.to_owned(),
                blueprint: reference.blueprint.to_owned(),
                title: None,
                properties: BTreeMap::new(),
                relations: BTreeMap::new(),
            };

            state.entities.insert(reference, entity);
        }
    }

    pub fn fail_identifier(&self, identifier: impl Into<String>) {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .failing_identifiers
            .insert(identifier.into());
    }

    pub fn fail_searches(&self) {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .fail_searches = true;
    }

    pub fn snapshot(&self) -> State {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .to_owned()
    }

    pub fn references(&self) -> Vec<EntityRef> {
        self.snapshot().entities.keys().cloned().collect()
    }
}

// -----------------------------------------------------------------------------
// CatalogClient implementation

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn get_app_config(&self, _integration: &str) -> Result<Option<PortAppConfig>, Error> {
        Ok(self.snapshot().app_config)
    }

    async fn get_blueprint(&self, _identifier: &str) -> Result<Option<Blueprint>, Error> {
        Ok(None)
    }

    async fn upsert_entities(
        &self,
        blueprint: &str,
        entities: &[Entity],
        _opts: &UpsertOpts,
    ) -> Result<BulkUpsert, Error> {
        let mut state = self
            .state
            .lock()
            .expect("memory catalog lock to not be poisoned");

        state
            .upsert_calls
            .push((blueprint.to_string(), entities.len()));

        let mut outcome = BulkUpsert::default();
        for entity in entities {
            let reference = entity.reference();

            if state.failing_identifiers.remove(&entity.identifier) {
                outcome.failed.push(FailedUpsert {
                    reference,
                    message: "scripted failure".to_string(),
                });
                continue;
            }

            state.operations.push(Operation::Upsert(reference.to_owned()));
            state.entities.insert(reference.to_owned(), entity.to_owned());
            outcome.upserted.push(reference);
        }

        Ok(outcome)
    }

    async fn search_entities(
        &self,
        _integration: &str,
        blueprint: &str,
    ) -> Result<Vec<EntityRef>, Error> {
        let state = self
            .state
            .lock()
            .expect("memory catalog lock to not be poisoned");

        if state.fail_searches {
            return Err(Error::Status {
                status: 500,
                body: "scripted search failure".to_string(),
            });
        }

        Ok(state
            .entities
            .keys()
            .filter(|reference| reference.blueprint == blueprint)
            .cloned()
            .collect())
    }

    async fn delete_entity(
        &self,
        reference: &EntityRef,
        _opts: &DeleteOpts,
    ) -> Result<DeleteOutcome, Error> {
        let mut state = self
            .state
            .lock()
            .expect("memory catalog lock to not be poisoned");

        state.operations.push(Operation::Delete(reference.to_owned()));
        match state.entities.remove(reference) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn register_integration(&self, spec: &IntegrationSpec) -> Result<(), Error> {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .registrations
            .push(spec.to_owned());

        Ok(())
    }

    async fn patch_integration(&self, _integration: &str, patch: &StatusPatch) -> Result<(), Error> {
        self.state
            .lock()
            .expect("memory catalog lock to not be poisoned")
            .patches
            .push(patch.to_owned());

        Ok(())
    }
}
