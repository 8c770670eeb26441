//! Ingestion engine orchestration module.

pub mod core;

pub use core::{IngestBackends, IngestEngine, RunSummary};
