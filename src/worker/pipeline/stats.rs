//! Run counters shared by the pipeline tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// Lock-free counters updated by the event loop and the flush path.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    irrelevant: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    enqueued: AtomicU64,
    persisted: AtomicU64,
    store_duplicates: AtomicU64,
    store_rejected: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`] plus buffer drop counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Events received from the source.
    pub received: u64,
    /// Events dropped by the classifier.
    pub irrelevant: u64,
    /// Events refused by the normalizer.
    pub rejected: u64,
    /// Events dropped as recently seen URIs.
    pub duplicates: u64,
    /// Records placed in the buffer.
    pub enqueued: u64,
    /// Records newly written by the sink.
    pub persisted: u64,
    /// Records the sink already held.
    pub store_duplicates: u64,
    /// Records refused individually by the sink and dropped.
    pub store_rejected: u64,
    /// Sink calls that returned a report.
    pub flushes: u64,
    /// Sink calls that failed and requeued their batch.
    pub failed_flushes: u64,
    /// Records dropped after exhausting attempts.
    pub dead_lettered: u64,
    /// Records dropped to respect the buffer bound.
    pub overflow_dropped: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "` by `n`.")]
            pub fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl IngestStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        add_received => received,
        add_irrelevant => irrelevant,
        add_rejected => rejected,
        add_duplicates => duplicates,
        add_enqueued => enqueued,
        add_persisted => persisted,
        add_store_duplicates => store_duplicates,
        add_store_rejected => store_rejected,
        add_flushes => flushes,
        add_failed_flushes => failed_flushes,
    }

    /// Copy the counters, filling buffer drop counts from the caller.
    #[must_use]
    pub fn snapshot(&self, dead_lettered: u64, overflow_dropped: u64) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            irrelevant: self.irrelevant.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            store_duplicates: self.store_duplicates.load(Ordering::Relaxed),
            store_rejected: self.store_rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dead_lettered,
            overflow_dropped,
        }
    }
}

impl StatsSnapshot {
    /// Emit the counters as one structured log line.
    pub fn log_summary(&self) {
        info!(
            received = self.received,
            irrelevant = self.irrelevant,
            rejected = self.rejected,
            duplicates = self.duplicates,
            enqueued = self.enqueued,
            persisted = self.persisted,
            store_duplicates = self.store_duplicates,
            store_rejected = self.store_rejected,
            flushes = self.flushes,
            failed_flushes = self.failed_flushes,
            dead_lettered = self.dead_lettered,
            overflow_dropped = self.overflow_dropped,
            "Ingestion summary"
        );
    }
}
