//! Core ingestion types: configuration, errors, stream events and records.

pub mod config;
pub mod errors;
pub mod event;
pub mod record;

pub use config::{
    BatchConfig, DedupeConfig, IngestConfig, MonitorConfig, ShutdownConfig, SinkConfig, SinkKind,
    SourceKind, StreamConfig,
};
pub use errors::{IngestError, IngestResult};
pub use event::{EventKind, POST_COLLECTION, PostPayload, StreamEvent};
pub use record::PostRecord;
