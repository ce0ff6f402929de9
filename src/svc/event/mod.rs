//! # Event module
//!
//! This module provides the live-event pipeline: webhook payloads are
//! wrapped into [`WebhookEvent`]s, fanned out to the matching processor
//! queues and applied to the catalog through the same mapping used by
//! resyncs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub mod dispatcher;
pub mod queue;

// -----------------------------------------------------------------------------
// WebhookEvent structure

/// one inbound webhook payload with its delivery metadata
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub trace_id: String,
    /// the webhook sub-path the payload arrived on, `/` for the root
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(path: impl Into<String>, headers: BTreeMap<String, String>, payload: Value) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            path: path.into(),
            headers,
            payload,
            received_at: Utc::now(),
        }
    }
}
