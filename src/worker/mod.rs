//! Firehose ingestion worker.
//!
//! This module turns a live stream of Bluesky posts into batched inserts of
//! topically relevant posts, organized into:
//! - `core`: Configuration, errors, stream events and persisted records
//! - `classify`: Keyword list and the relevance classifier
//! - `pipeline`: Normalizer, batch buffer, flush routine, scheduler and event loop
//! - `sink`: Bulk-insert targets (Supabase, SQLite)
//! - `source`: Upstream transports (Jetstream websocket, JSONL replay)
//! - `shutdown`: Signal handling and the final drain
//! - `engine`: Wiring of all of the above

pub mod classify;
pub mod core;
pub mod engine;
pub mod pipeline;
pub mod shutdown;
pub mod sink;
pub mod source;

// Re-export commonly used types for convenience
pub use classify::{MENTAL_HEALTH_KEYWORDS, RelevanceClassifier};
pub use core::{
    BatchConfig, DedupeConfig, EventKind, IngestConfig, IngestError, IngestResult, MonitorConfig,
    POST_COLLECTION, PostPayload, PostRecord, ShutdownConfig, SinkConfig, SinkKind, SourceKind,
    StreamConfig, StreamEvent,
};
pub use engine::{IngestBackends, IngestEngine, RunSummary};
pub use pipeline::{
    BatchBuffer, EventLoop, FlushOutcome, FlushScheduler, FlushTrigger, Flusher, IngestStats,
    Rejection, StatsSnapshot, normalize_event,
};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownState, wait_for_signal};
pub use sink::{InsertReport, PostSink, SinkError, SinkResult, SqliteSink, SupabaseSink};
pub use source::{EventSource, JetstreamSource, ReplaySource, SourceStats};
