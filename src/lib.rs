//! # Ocean
//!
//! An integration framework that synchronizes resources from third-party
//! systems into the Port software catalog. Integration binaries register
//! per-kind raw-record sources and webhook processors on a [`Runtime`]
//! builder; the runtime schedules full resyncs, dispatches live events and
//! reconciles the produced entities against the catalog.
//!
//! [`Runtime`]: crate::svc::runtime::Runtime

pub mod cmd;
pub mod logging;
pub mod svc;
