//! # Entity module
//!
//! This module provides the in-memory representation of catalog entities,
//! their identity, and the set operations backing the end-of-resync delete
//! phase.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::{self, Display, Formatter},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// -----------------------------------------------------------------------------
// Relation enumeration

/// a relation value, either one target identifier or a list of them
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(untagged)]
pub enum Relation {
    Single(String),
    Many(Vec<String>),
}

// -----------------------------------------------------------------------------
// Entity structure

/// the unit written to the catalog, one instance of a blueprint
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Entity {
    #[serde(rename = "identifier")]
    pub identifier: String,
    #[serde(rename = "blueprint")]
    pub blueprint: String,
    #[serde(rename = "title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "properties", default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(rename = "relations", default)]
    pub relations: BTreeMap<String, Relation>,
}

impl Entity {
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            blueprint: self.blueprint.to_owned(),
            identifier: self.identifier.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// EntityRef structure

/// the unit of identity, unique per blueprint
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct EntityRef {
    #[serde(rename = "blueprint")]
    pub blueprint: String,
    #[serde(rename = "identifier")]
    pub identifier: String,
}

impl EntityRef {
    pub fn new(blueprint: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            blueprint: blueprint.into(),
            identifier: identifier.into(),
        }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.blueprint, self.identifier)
    }
}

// -----------------------------------------------------------------------------
// SeenSet structure

/// the set of entity references produced during one resync run, shared by the
/// per-kind pipelines and read by the delete phase
#[derive(Default, Debug)]
pub struct SeenSet {
    inner: Mutex<HashSet<EntityRef>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<I>(&self, references: I)
    where
        I: IntoIterator<Item = EntityRef>,
    {
        let mut inner = self.inner.lock().expect("seen set lock to not be poisoned");

        inner.extend(references);
    }

    pub fn contains(&self, reference: &EntityRef) -> bool {
        self.inner
            .lock()
            .expect("seen set lock to not be poisoned")
            .contains(reference)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("seen set lock to not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashSet<EntityRef> {
        self.inner
            .lock()
            .expect("seen set lock to not be poisoned")
            .to_owned()
    }
}

// -----------------------------------------------------------------------------
// Diff helpers

/// returns the catalog entities not produced during this resync, the
/// candidates for deletion
pub fn deletion_candidates(catalog: &[EntityRef], seen: &HashSet<EntityRef>) -> Vec<EntityRef> {
    catalog
        .iter()
        .filter(|reference| !seen.contains(reference))
        .cloned()
        .collect()
}

/// returns whether deleting `candidates` entities out of `total` attributed
/// ones would exceed the configured threshold. A full wipe of a non-empty
/// catalog set is the misconfiguration this guards against
pub fn exceeds_threshold(candidates: usize, total: usize, threshold: f64) -> bool {
    if total == 0 || candidates == 0 {
        return false;
    }

    (candidates as f64) / (total as f64) > threshold
}

// -----------------------------------------------------------------------------
// Tests
