//! The single flush routine shared by every trigger.
//!
//! Interval ticks, fill signals and the shutdown drain all call
//! [`Flusher::attempt_flush`]. An atomic in-progress flag makes a concurrent
//! call return [`FlushOutcome::Skipped`] instead of waiting; the next tick or
//! fill signal picks up whatever is left.
//!
//! While a sink call is pending the batch exists only inside the flush future.
//! Its URIs are kept aside so that a flush cancelled at shutdown can still be
//! accounted for through [`Flusher::take_in_flight`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::worker::pipeline::buffer::{BatchBuffer, RequeueReport};
use crate::worker::pipeline::stats::IngestStats;
use crate::worker::sink::{InsertReport, PostSink, SinkError};

/// Result of one flush attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Another flush was already running.
    Skipped,
    /// The buffer held nothing to flush.
    Empty,
    /// The sink accepted the batch, minus any individually rejected records.
    Persisted {
        /// Batch identifier.
        batch_id: Uuid,
        /// Records handed to the sink.
        size: usize,
        /// Sink report.
        report: InsertReport,
    },
    /// The sink call failed and the batch went back to the buffer.
    Requeued {
        /// Batch identifier.
        batch_id: Uuid,
        /// Records handed to the sink.
        size: usize,
        /// Error label.
        error: &'static str,
        /// What happened to the records on the way back.
        requeue: RequeueReport,
    },
}

impl FlushOutcome {
    /// Whether the attempt reached the sink and succeeded.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

/// Clears the in-progress flag on drop.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the buffer into the sink, one batch per call.
pub struct Flusher {
    buffer: Arc<BatchBuffer>,
    sink: Arc<dyn PostSink>,
    stats: Arc<IngestStats>,
    timeout: Duration,
    in_progress: AtomicBool,
    in_flight: Mutex<Vec<String>>,
}

impl Flusher {
    /// Create a flusher over a buffer and sink.
    ///
    /// `timeout` bounds each sink call; an elapsed call counts as a failure.
    #[must_use]
    pub fn new(
        buffer: Arc<BatchBuffer>,
        sink: Arc<dyn PostSink>,
        stats: Arc<IngestStats>,
        timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            sink,
            stats,
            timeout,
            in_progress: AtomicBool::new(false),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Buffer this flusher drains.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    /// Whether a flush is currently running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Take the URIs of a batch whose flush was dropped mid-insert.
    ///
    /// Empty unless a flush future was cancelled while the sink call was
    /// pending; those records are neither persisted nor back in the buffer.
    #[must_use]
    pub fn take_in_flight(&self) -> Vec<String> {
        std::mem::take(&mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_in_flight(&self, uris: Vec<String>) -> Vec<String> {
        std::mem::replace(
            &mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner),
            uris,
        )
    }

    /// Drain one batch and hand it to the sink.
    ///
    /// Never waits for a concurrent flush. On failure the whole batch is
    /// requeued; records the sink rejects individually are logged and dropped.
    pub async fn attempt_flush(&self) -> FlushOutcome {
        let Some(_guard) = InProgress::acquire(&self.in_progress) else {
            debug!("Flush already in progress, skipping trigger");
            return FlushOutcome::Skipped;
        };

        let mut batch = self.buffer.drain_for_flush();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch_id = batch.id();
        let size = batch.len();
        let sink = self.sink.name();

        let uris = batch.records().iter().map(|r| r.uri.clone()).collect();
        let stale = self.set_in_flight(uris);
        for uri in &stale {
            error!(uri = %uri, "Record lost by an interrupted flush");
        }
        let result = match tokio::time::timeout(self.timeout, self.sink.insert_batch(batch.records()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        };
        // No await below: the batch is either persisted or requeued from here.
        self.set_in_flight(Vec::new());

        match result {
            Ok(report) => {
                if !report.rejected.is_empty() {
                    for rejected in &report.rejected {
                        let uri = batch
                            .records()
                            .get(rejected.index)
                            .map_or("<unknown>", |r| r.uri.as_str());
                        error!(
                            %batch_id,
                            uri,
                            reason = %rejected.reason,
                            "Record rejected by store, dropping"
                        );
                    }
                    let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
                    let dropped = batch.take_indices(&indices);
                    self.stats.add_store_rejected(dropped.len() as u64);
                }

                self.stats.add_flushes(1);
                self.stats.add_persisted(report.inserted as u64);
                self.stats.add_store_duplicates(report.duplicates as u64);
                info!(
                    %batch_id,
                    size,
                    sink,
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    rejected = report.rejected.len(),
                    "Batch persisted"
                );

                FlushOutcome::Persisted {
                    batch_id,
                    size,
                    report,
                }
            }
            Err(err) => {
                self.stats.add_failed_flushes(1);
                let kind = err.kind();
                warn!(
                    %batch_id,
                    size,
                    sink,
                    error = %err,
                    kind,
                    transient = err.is_transient(),
                    "Batch insert failed, requeueing"
                );
                let requeue = self.buffer.requeue(batch);
                FlushOutcome::Requeued {
                    batch_id,
                    size,
                    error: kind,
                    requeue,
                }
            }
        }
    }
}
