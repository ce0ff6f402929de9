//! # Telemetry module
//!
//! This module exposes the metric counters tracking resync and live-event
//! progress. Counters compile away when the `metrics` feature is disabled,
//! call sites stay unconditional.

#[cfg(feature = "metrics")]
use std::sync::LazyLock;
use std::time::Duration;

#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
};

// -----------------------------------------------------------------------------
// Statics

#[cfg(feature = "metrics")]
static RESYNC_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_resync_runs_count",
        "Number of resync runs by final status",
        &["status"]
    )
    .expect("'ocean_resync_runs_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static RESYNC_RECORDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_resync_records_count",
        "Number of raw records pulled from sources",
        &["kind"]
    )
    .expect("'ocean_resync_records_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static ENTITIES_UPSERTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_entities_upserted_count",
        "Number of entities upserted to the catalog",
        &["kind"]
    )
    .expect("'ocean_entities_upserted_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static ENTITIES_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_entities_failed_count",
        "Number of entities that failed to upsert",
        &["kind"]
    )
    .expect("'ocean_entities_failed_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static ENTITIES_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_entities_deleted_count",
        "Number of stale entities deleted from the catalog",
        &["kind"]
    )
    .expect("'ocean_entities_deleted_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static MAPPING_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_mapping_errors_count",
        "Number of per-record mapping failures",
        &["kind"]
    )
    .expect("'ocean_mapping_errors_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static KIND_DURATION: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_resync_kind_duration",
        "Cumulated duration of per-kind resync pipelines",
        &["kind", "unit"]
    )
    .expect("'ocean_resync_kind_duration' to not be already registered")
});

#[cfg(feature = "metrics")]
static EVENTS_ENQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_events_enqueued_count",
        "Number of webhook events accepted into processor queues",
        &["path"]
    )
    .expect("'ocean_events_enqueued_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static EVENTS_PROCESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "ocean_events_processed_count",
        "Number of webhook events by processing outcome",
        &["path", "outcome"]
    )
    .expect("'ocean_events_processed_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "ocean_event_queue_depth",
        "Current depth of processor queues",
        &["path"]
    )
    .expect("'ocean_event_queue_depth' to not be already registered")
});

// -----------------------------------------------------------------------------
// helpers

pub fn resync_run(status: &str) {
    #[cfg(feature = "metrics")]
    RESYNC_RUNS.with_label_values(&[status]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = status;
}

pub fn records_seen(kind: &str, count: usize) {
    #[cfg(feature = "metrics")]
    RESYNC_RECORDS
        .with_label_values(&[kind])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, count);
}

pub fn entities_upserted(kind: &str, count: usize) {
    #[cfg(feature = "metrics")]
    ENTITIES_UPSERTED
        .with_label_values(&[kind])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, count);
}

pub fn entities_failed(kind: &str, count: usize) {
    #[cfg(feature = "metrics")]
    ENTITIES_FAILED
        .with_label_values(&[kind])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, count);
}

pub fn entities_deleted(kind: &str, count: usize) {
    #[cfg(feature = "metrics")]
    ENTITIES_DELETED
        .with_label_values(&[kind])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, count);
}

pub fn mapping_errors(kind: &str, count: usize) {
    #[cfg(feature = "metrics")]
    MAPPING_ERRORS
        .with_label_values(&[kind])
        .inc_by(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, count);
}

pub fn kind_duration(kind: &str, duration: Duration) {
    #[cfg(feature = "metrics")]
    KIND_DURATION
        .with_label_values(&[kind, "us"])
        .inc_by(duration.as_micros() as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, duration);
}

pub fn event_enqueued(path: &str) {
    #[cfg(feature = "metrics")]
    EVENTS_ENQUEUED.with_label_values(&[path]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = path;
}

pub fn event_processed(path: &str, outcome: &str) {
    #[cfg(feature = "metrics")]
    EVENTS_PROCESSED.with_label_values(&[path, outcome]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = (path, outcome);
}

pub fn queue_depth(path: &str, depth: usize) {
    #[cfg(feature = "metrics")]
    QUEUE_DEPTH.with_label_values(&[path]).set(depth as i64);
    #[cfg(not(feature = "metrics"))]
    let _ = (path, depth);
}
