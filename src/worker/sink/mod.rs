//! Persistence sinks for normalized posts.
//!
//! A sink performs one bulk insert per batch and reports either a whole-batch
//! failure or an [`InsertReport`]. Stores that can tell which rows they refused
//! list them in `rejected`; the flush routine splices those out instead of
//! retrying the whole batch.

pub mod error;
pub mod sqlite;
pub mod supabase;

pub use error::{SinkError, SinkResult};
pub use sqlite::SqliteSink;
pub use supabase::SupabaseSink;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::worker::core::config::{SinkConfig, SinkKind};
use crate::worker::core::record::PostRecord;

/// Boxed future type for sink operations.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A record the store refused individually.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectedRecord {
    /// Position of the record in the submitted slice.
    pub index: usize,
    /// Store-provided reason.
    pub reason: String,
}

/// Per-batch insert result.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InsertReport {
    /// Rows newly written.
    pub inserted: usize,
    /// Rows already present under the same `uri`.
    pub duplicates: usize,
    /// Rows refused individually; everything else was persisted.
    pub rejected: Vec<RejectedRecord>,
}

impl InsertReport {
    /// Report for a batch written in full.
    #[must_use]
    pub const fn inserted(count: usize) -> Self {
        Self {
            inserted: count,
            duplicates: 0,
            rejected: Vec::new(),
        }
    }
}

/// Bulk-insert target for batches of posts.
pub trait PostSink: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &'static str;

    /// Insert a non-empty batch in a single call.
    ///
    /// # Errors
    /// Returns an error if the batch as a whole could not be persisted.
    fn insert_batch<'a>(
        &'a self,
        records: &'a [PostRecord],
    ) -> SinkFuture<'a, SinkResult<InsertReport>>;
}

/// Build the sink selected by configuration.
///
/// # Errors
/// Returns an error if the sink cannot be initialized.
pub async fn build_sink(config: &SinkConfig) -> SinkResult<Arc<dyn PostSink>> {
    let sink: Arc<dyn PostSink> = match config.kind {
        SinkKind::Supabase => Arc::new(SupabaseSink::new(config)?),
        SinkKind::Sqlite => Arc::new(SqliteSink::open(config).await?),
    };
    Ok(sink)
}
