//! # Mapping module
//!
//! This module provides the mapping document model and its evaluator. A
//! [`PortAppConfig`] declares, per resource kind, how raw third-party records
//! translate into catalog entities; the [`compiler`] turns it into compiled
//! expressions evaluated once per record.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::svc::{
    catalog::{client, CatalogClient},
    cfg::Configuration,
    expr,
};

pub mod compiler;

// -----------------------------------------------------------------------------
// Selector structure

/// filters the raw records a kind produces entities from. Integration code
/// may carry kind-specific fields next to the query, the core ignores them
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Selector {
    #[serde(rename = "query", default = "default_query")]
    pub query: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            query: default_query(),
            extra: BTreeMap::new(),
        }
    }
}

fn default_query() -> String {
    "true".to_string()
}

// -----------------------------------------------------------------------------
// Mappings structure

/// the expressions producing each entity field
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Mappings {
    #[serde(rename = "identifier")]
    pub identifier: String,
    #[serde(rename = "title", default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "blueprint")]
    pub blueprint: String,
    #[serde(rename = "properties", default)]
    pub properties: BTreeMap<String, String>,
    #[serde(rename = "relations", default)]
    pub relations: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// EntityMapping structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct EntityMapping {
    #[serde(rename = "mappings")]
    pub mappings: Mappings,
}

// -----------------------------------------------------------------------------
// PortResourceConfig structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct PortResourceConfig {
    #[serde(rename = "entity")]
    pub entity: EntityMapping,
    /// extracts a sub-array to iterate over when one raw record represents
    /// several entities
    #[serde(rename = "itemsToParse", default, skip_serializing_if = "Option::is_none")]
    pub items_to_parse: Option<String>,
}

// -----------------------------------------------------------------------------
// ResourceConfig structure

/// the configuration of one resource kind
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ResourceConfig {
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "selector", default)]
    pub selector: Selector,
    #[serde(rename = "port")]
    pub port: PortResourceConfig,
    #[serde(
        rename = "createMissingRelatedEntities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub create_missing_related_entities: Option<bool>,
    #[serde(
        rename = "deleteDependentEntities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delete_dependent_entities: Option<bool>,
}

// -----------------------------------------------------------------------------
// PortAppConfig structure

/// the full mapping document, fetched from the catalog at resync start and
/// on event receipt
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PortAppConfig {
    #[serde(rename = "resources", default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(
        rename = "createMissingRelatedEntities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub create_missing_related_entities: Option<bool>,
    #[serde(
        rename = "deleteDependentEntities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delete_dependent_entities: Option<bool>,
}

impl PortAppConfig {
    pub fn resource(&self, kind: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|resource| resource.kind == kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.resources
            .iter()
            .map(|resource| resource.kind.as_str())
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read mapping document '{0}', {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse mapping document, {0}")]
    Parse(serde_yaml::Error),
    #[error("failed to compile expression '{name}' of kind '{kind}', {source}")]
    Compile {
        kind: String,
        name: String,
        source: expr::Error,
    },
    #[error("kind '{0}' is declared more than once in the mapping document")]
    DuplicateKind(String),
    #[error("failed to fetch mapping document from the catalog, {0}")]
    Fetch(client::Error),
}

// -----------------------------------------------------------------------------
// helpers

/// loads the local fallback mapping document
pub fn from_path(path: &Path) -> Result<PortAppConfig, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::Read(path.display().to_string(), err))?;

    serde_yaml::from_str(&content).map_err(Error::Parse)
}

/// returns the mapping document held by the catalog, falling back to the
/// local document when the catalog has none yet
pub async fn load(
    catalog: &dyn CatalogClient,
    config: &Configuration,
) -> Result<PortAppConfig, Error> {
    match catalog.get_app_config(&config.integration.identifier).await {
        Ok(Some(app_config)) => Ok(app_config),
        Ok(None) => from_path(Path::new(&config.resources_path)),
        Err(err) => Err(Error::Fetch(err)),
    }
}

// -----------------------------------------------------------------------------
// Tests
