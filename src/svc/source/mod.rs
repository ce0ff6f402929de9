//! # Source module
//!
//! This module provides the contract integration-specific code implements:
//! per-kind asynchronous producers of raw-record batches, and webhook
//! processors reacting to live events. Implementations are registered on the
//! runtime builder and driven by the resync pipeline and the event
//! dispatcher.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::svc::{context::RunContext, event::WebhookEvent, mapping::ResourceConfig};

// -----------------------------------------------------------------------------
// types

/// an opaque, JSON-like tree produced by integration code. The core never
/// assumes a schema
pub type RawRecord = Value;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("source failed, {0}")]
    Produce(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("source failed, {0}")]
    Message(String),
}

impl Error {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Produce(err)
    }
}

/// third-party hiccups behind a processor are worth another attempt
impl crate::svc::catalog::retry::Classify for Error {
    fn class(&self) -> crate::svc::catalog::retry::ErrorClass {
        crate::svc::catalog::retry::ErrorClass::Transient
    }
}

// -----------------------------------------------------------------------------
// BatchIterator trait

/// a lazy sequence of raw-record batches. Producers page through the third
/// party internally and may yield an indefinite number of batches
#[async_trait]
pub trait BatchIterator: Send {
    /// returns the next batch, or `None` once the source is exhausted
    async fn next(&mut self) -> Result<Option<Vec<RawRecord>>, Error>;

    /// cleanup hook, invoked when the pipeline is done with the iterator,
    /// on completion, failure and cancellation alike
    async fn close(&mut self) {}

    /// optional total record count for progress reporting
    fn total_hint(&self) -> Option<u64> {
        None
    }
}

// -----------------------------------------------------------------------------
// RawRecordSource trait

/// the per-kind capability integration code registers for full resyncs
#[async_trait]
pub trait RawRecordSource: Send + Sync {
    async fn produce(&self, ctx: &RunContext) -> Result<Box<dyn BatchIterator>, Error>;
}

// -----------------------------------------------------------------------------
// RawResults structure

/// what a webhook processor extracted from one event: records to upsert and
/// records whose mapped entities must be deleted
#[derive(Default, Debug)]
pub struct RawResults {
    pub updated: Vec<RawRecord>,
    pub deleted: Vec<RawRecord>,
}

// -----------------------------------------------------------------------------
// WebhookProcessor trait

/// reacts to live events delivered on a webhook path. Each processor owns a
/// FIFO queue; its hooks run on the queue worker
#[async_trait]
pub trait WebhookProcessor: Send + Sync {
    /// cheap predicate deciding whether the event enters this processor's
    /// queue
    async fn should_process(&self, _event: &WebhookEvent) -> bool {
        true
    }

    async fn authenticate(&self, _payload: &Value, _headers: &BTreeMap<String, String>) -> bool {
        true
    }

    async fn validate_payload(&self, _payload: &Value) -> bool {
        true
    }

    /// the resource kinds this event affects
    async fn matching_kinds(&self, event: &WebhookEvent) -> Vec<String>;

    /// re-fetches authoritative data for the event and splits it into
    /// records to upsert and records to delete
    async fn handle(
        &self,
        event: &WebhookEvent,
        resource: &ResourceConfig,
    ) -> Result<RawResults, Error>;

    /// per-processor retry budget, the integration default applies when
    /// `None`
    fn max_retries(&self) -> Option<u32> {
        None
    }
}

// -----------------------------------------------------------------------------
// Registry structure

/// the sources and processors registered by integration code, keyed by kind
/// and webhook path
#[derive(Default)]
pub struct Registry {
    sources: Vec<(String, Arc<dyn RawRecordSource>)>,
    processors: HashMap<String, Vec<Arc<dyn WebhookProcessor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_resync(&mut self, kind: impl Into<String>, source: Arc<dyn RawRecordSource>) {
        let kind = kind.into();

        self.sources.retain(|(existing, _)| *existing != kind);
        self.sources.push((kind, source));
    }

    pub fn register_webhook_processor(
        &mut self,
        path: impl AsRef<str>,
        processor: Arc<dyn WebhookProcessor>,
    ) {
        self.processors
            .entry(normalize_path(path.as_ref()))
            .or_default()
            .push(processor);
    }

    pub fn source(&self, kind: &str) -> Option<Arc<dyn RawRecordSource>> {
        self.sources
            .iter()
            .find(|(existing, _)| existing == kind)
            .map(|(_, source)| source.to_owned())
    }

    /// registration order is preserved, it is the order kinds resync in
    pub fn kinds(&self) -> Vec<String> {
        self.sources.iter().map(|(kind, _)| kind.to_owned()).collect()
    }

    pub fn processors(&self, path: &str) -> &[Arc<dyn WebhookProcessor>] {
        self.processors
            .get(&normalize_path(path))
            .map(|processors| processors.as_slice())
            .unwrap_or(&[])
    }

    /// every registered processor with its path, in registration order per
    /// path
    pub fn all_processors(&self) -> Vec<(String, usize, Arc<dyn WebhookProcessor>)> {
        let mut all = vec![];

        for (path, processors) in &self.processors {
            for (index, processor) in processors.iter().enumerate() {
                all.push((path.to_owned(), index, processor.to_owned()));
            }
        }

        all
    }

}

pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }

    format!("/{trimmed}")
}

// -----------------------------------------------------------------------------
// StaticSource structure

/// a source yielding a fixed list of batches, convenient for integrations
/// that fetch everything upfront and for tests
pub struct StaticSource {
    batches: Vec<Vec<RawRecord>>,
}

pub fn from_batches(batches: Vec<Vec<RawRecord>>) -> Arc<dyn RawRecordSource> {
    Arc::new(StaticSource { batches })
}

#[async_trait]
impl RawRecordSource for StaticSource {
    async fn produce(&self, _ctx: &RunContext) -> Result<Box<dyn BatchIterator>, Error> {
        Ok(Box::new(StaticIterator {
            total: self.batches.iter().map(|batch| batch.len() as u64).sum(),
            remaining: self.batches.iter().cloned().collect(),
        }))
    }
}

struct StaticIterator {
    total: u64,
    remaining: VecDeque<Vec<RawRecord>>,
}

#[async_trait]
impl BatchIterator for StaticIterator {
    async fn next(&mut self) -> Result<Option<Vec<RawRecord>>, Error> {
        Ok(self.remaining.pop_front())
    }

    fn total_hint(&self) -> Option<u64> {
        Some(self.total)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{from_batches, normalize_path, Registry};
    use crate::svc::{cfg::tests_support::configuration, context::RunContext};

    #[test]
    fn paths_should_be_normalized() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("integration"), "/integration");
        assert_eq!(normalize_path("/integration/"), "/integration");
    }

    #[test]
    fn registering_a_kind_twice_should_replace_the_source() {
        let mut registry = Registry::new();

        registry.register_resync("issue", from_batches(vec![]));
        registry.register_resync("project", from_batches(vec![]));
        registry.register_resync("issue", from_batches(vec![]));

        assert_eq!(registry.kinds(), vec!["issue", "project"]);
    }

    #[tokio::test]
    async fn static_source_should_yield_batches_in_order() {
        let source = from_batches(vec![
            vec![json!({"id": "A"}), json!({"id": "B"})],
            vec![json!({"id": "C"})],
        ]);

        let ctx = RunContext::new(Arc::new(configuration()));
        let mut iterator = source.produce(&ctx).await.expect("source to produce");

        assert_eq!(iterator.total_hint(), Some(3));

        let first = iterator.next().await.expect("batch").expect("first batch");
        assert_eq!(first.len(), 2);

        let second = iterator.next().await.expect("batch").expect("second batch");
        assert_eq!(second[0], json!({"id": "C"}));

        assert!(iterator.next().await.expect("batch").is_none());
        iterator.close().await;
    }
}
