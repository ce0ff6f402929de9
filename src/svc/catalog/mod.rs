//! # Catalog module
//!
//! This module provides the entity model and the typed surface used to talk
//! to the Port catalog: batched upserts, attributed-entity search, deletion,
//! integration registration and state reporting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::svc::{catalog::entity::{Entity, EntityRef}, mapping::PortAppConfig};

pub mod client;
pub mod entity;
#[cfg(test)]
pub mod memory;
pub mod retry;

// -----------------------------------------------------------------------------
// IntegrationSpec structure

/// the startup handshake payload identifying this integration instance
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct IntegrationSpec {
    #[serde(rename = "installationId")]
    pub identifier: String,
    #[serde(rename = "installationAppType")]
    pub kind: String,
    #[serde(rename = "version")]
    pub version: String,
    #[serde(rename = "host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

// -----------------------------------------------------------------------------
// StatusPatch structure

/// one resync state transition, surfaced to users through the catalog
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct StatusPatch {
    #[serde(rename = "status")]
    pub status: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(rename = "summary", skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
}

// -----------------------------------------------------------------------------
// Blueprint structure

/// a schema descriptor as returned by the catalog
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Blueprint {
    #[serde(rename = "identifier")]
    pub identifier: String,
    #[serde(rename = "title")]
    pub title: Option<String>,
    #[serde(rename = "schema", default)]
    pub schema: Value,
    #[serde(rename = "relations", default)]
    pub relations: Value,
}

// -----------------------------------------------------------------------------
// Options structures

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct UpsertOpts {
    pub create_missing_related_entities: bool,
    pub merge: bool,
}

impl Default for UpsertOpts {
    fn default() -> Self {
        Self {
            create_missing_related_entities: true,
            merge: true,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct DeleteOpts {
    pub delete_dependents: bool,
}

// -----------------------------------------------------------------------------
// Outcome structures

/// per-entity results of one bulk upsert, failures are isolated from the
/// batch
#[derive(PartialEq, Clone, Debug, Default)]
pub struct BulkUpsert {
    pub upserted: Vec<EntityRef>,
    pub failed: Vec<FailedUpsert>,
}

#[derive(PartialEq, Clone, Debug)]
pub struct FailedUpsert {
    pub reference: EntityRef,
    pub message: String,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

// -----------------------------------------------------------------------------
// CatalogClient trait

/// typed operations against the remote catalog. The production
/// implementation is [`client::PortClient`]; tests swap an in-memory one
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// returns the mapping document held by the catalog for this integration
    async fn get_app_config(
        &self,
        integration: &str,
    ) -> Result<Option<PortAppConfig>, client::Error>;

    async fn get_blueprint(&self, identifier: &str) -> Result<Option<Blueprint>, client::Error>;

    async fn upsert_entities(
        &self,
        blueprint: &str,
        entities: &[Entity],
        opts: &UpsertOpts,
    ) -> Result<BulkUpsert, client::Error>;

    /// enumerates the entities of one blueprint attributed to the given
    /// integration instance, following pagination to exhaustion
    async fn search_entities(
        &self,
        integration: &str,
        blueprint: &str,
    ) -> Result<Vec<EntityRef>, client::Error>;

    async fn delete_entity(
        &self,
        reference: &EntityRef,
        opts: &DeleteOpts,
    ) -> Result<DeleteOutcome, client::Error>;

    async fn register_integration(&self, spec: &IntegrationSpec) -> Result<(), client::Error>;

    async fn patch_integration(
        &self,
        integration: &str,
        patch: &StatusPatch,
    ) -> Result<(), client::Error>;
}
