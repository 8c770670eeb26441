//! Bounded in-memory queue of records awaiting persistence.
//!
//! All mutations go through one mutex: the event loop enqueues while the flush
//! path drains and requeues from another task. A record leaves the buffer only
//! by being drained into a batch; a failed batch comes back through `requeue`,
//! ahead of anything that arrived meanwhile.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, warn};
use uuid::Uuid;

use crate::worker::core::config::BatchConfig;
use crate::worker::core::record::PostRecord;

#[derive(Debug)]
struct Pending {
    record: PostRecord,
    attempts: u32,
}

/// Records detached from the buffer for one insert attempt.
#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    records: Vec<PostRecord>,
    attempts: Vec<u32>,
}

impl Batch {
    /// Identifier used to correlate log lines for this attempt.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Records in buffer order.
    #[must_use]
    pub fn records(&self) -> &[PostRecord] {
        &self.records
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove records at the given indices, returning them.
    ///
    /// Out-of-range indices are ignored.
    pub fn take_indices(&mut self, indices: &[usize]) -> Vec<PostRecord> {
        let mut sorted: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| i < self.records.len())
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut taken = Vec::with_capacity(sorted.len());
        for idx in sorted.into_iter().rev() {
            self.attempts.remove(idx);
            taken.push(self.records.remove(idx));
        }
        taken.reverse();
        taken
    }
}

/// Outcome of putting a failed batch back.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequeueReport {
    /// Records placed back at the head of the buffer.
    pub requeued: usize,
    /// Records dropped after exhausting their attempts.
    pub dead_lettered: usize,
    /// Records dropped to respect the buffer bound.
    pub overflow_dropped: usize,
}

/// Mutex-guarded queue with a size-triggered flush signal.
#[derive(Debug)]
pub struct BatchBuffer {
    queue: Mutex<VecDeque<Pending>>,
    max_batch_size: usize,
    max_attempts: Option<u32>,
    max_buffered: Option<usize>,
    overflow_dropped: AtomicU64,
    dead_lettered: AtomicU64,
}

impl BatchBuffer {
    /// Create a buffer from batch settings.
    #[must_use]
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.max_batch_size)),
            max_batch_size: config.max_batch_size.max(1),
            max_attempts: config.max_attempts,
            max_buffered: config.max_buffered,
            overflow_dropped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// Create an unbounded buffer with the given batch size.
    #[must_use]
    pub fn with_batch_size(max_batch_size: usize) -> Self {
        Self::new(&BatchConfig {
            max_batch_size,
            ..BatchConfig::default()
        })
    }

    /// Records per drained batch.
    #[must_use]
    pub const fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Append a record; returns `true` once a full batch is waiting.
    pub fn enqueue(&self, record: PostRecord) -> bool {
        let mut queue = self.lock();
        queue.push_back(Pending {
            record,
            attempts: 0,
        });
        self.enforce_bound(&mut queue);
        queue.len() >= self.max_batch_size
    }

    /// Detach up to `max_batch_size` records from the head.
    #[must_use]
    pub fn drain_for_flush(&self) -> Batch {
        let mut queue = self.lock();
        let take = queue.len().min(self.max_batch_size);
        let mut records = Vec::with_capacity(take);
        let mut attempts = Vec::with_capacity(take);
        for pending in queue.drain(..take) {
            records.push(pending.record);
            attempts.push(pending.attempts);
        }
        drop(queue);

        Batch {
            id: Uuid::new_v4(),
            records,
            attempts,
        }
    }

    /// Put a failed batch back at the head, preserving its order.
    ///
    /// Records that reach the configured attempt limit are logged and dropped
    /// instead of requeued.
    pub fn requeue(&self, batch: Batch) -> RequeueReport {
        let mut report = RequeueReport::default();
        let batch_id = batch.id;

        let mut retained = Vec::with_capacity(batch.records.len());
        for (record, attempts) in batch.records.into_iter().zip(batch.attempts) {
            let attempts = attempts.saturating_add(1);
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                error!(
                    %batch_id,
                    uri = %record.uri,
                    attempts,
                    "Dropping record after exhausting insert attempts"
                );
                report.dead_lettered += 1;
                continue;
            }
            retained.push(Pending { record, attempts });
        }

        let mut queue = self.lock();
        report.requeued = retained.len();
        for pending in retained.into_iter().rev() {
            queue.push_front(pending);
        }
        report.overflow_dropped = self.enforce_bound(&mut queue);
        drop(queue);

        self.dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);
        report
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether at least one full batch is waiting.
    #[must_use]
    pub fn has_full_batch(&self) -> bool {
        self.len() >= self.max_batch_size
    }

    /// Records dropped so far to respect the buffer bound.
    #[must_use]
    pub fn overflow_dropped(&self) -> u64 {
        self.overflow_dropped.load(Ordering::Relaxed)
    }

    /// Records dropped so far after exhausting their attempts.
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Drop the oldest records beyond the configured bound.
    fn enforce_bound(&self, queue: &mut VecDeque<Pending>) -> usize {
        let Some(max) = self.max_buffered else {
            return 0;
        };
        let excess = queue.len().saturating_sub(max);
        if excess == 0 {
            return 0;
        }
        for pending in queue.drain(..excess) {
            warn!(uri = %pending.record.uri, "Buffer bound reached, dropping oldest record");
        }
        self.overflow_dropped
            .fetch_add(excess as u64, Ordering::Relaxed);
        excess
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn record(n: usize) -> PostRecord {
        let now = Utc::now();
        PostRecord {
            uri: format!("at://did:plc:test/app.bsky.feed.post/{n}"),
            author_id: "did:plc:test".to_string(),
            text: format!("post {n}"),
            created_at: now,
            languages: Vec::new(),
            facets: None,
            embed: None,
            ingestion_time: now,
        }
    }

    fn uris(records: &[PostRecord]) -> Vec<String> {
        records.iter().map(|r| r.uri.clone()).collect()
    }

    #[test]
    fn test_drain_preserves_order() {
        let buffer = BatchBuffer::with_batch_size(10);
        for n in 1..=3 {
            buffer.enqueue(record(n));
        }
        let batch = buffer.drain_for_flush();
        assert_eq!(uris(batch.records()), uris(&[record(1), record(2), record(3)]));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_enqueue_reports_full() {
        let buffer = BatchBuffer::with_batch_size(3);
        assert!(!buffer.enqueue(record(1)));
        assert!(!buffer.enqueue(record(2)));
        assert!(buffer.enqueue(record(3)));
        assert!(buffer.enqueue(record(4)));
        assert!(buffer.has_full_batch());
    }

    #[test]
    fn test_drain_takes_at_most_batch_size() {
        let buffer = BatchBuffer::with_batch_size(2);
        for n in 0..5 {
            buffer.enqueue(record(n));
        }
        let first = buffer.drain_for_flush();
        assert_eq!(first.len(), 2);
        assert_eq!(buffer.len(), 3);
        assert_eq!(first.records()[0].uri, record(0).uri);
    }

    #[test]
    fn test_drain_empty_buffer() {
        let buffer = BatchBuffer::with_batch_size(2);
        assert!(buffer.drain_for_flush().is_empty());
    }

    #[test]
    fn test_requeue_goes_ahead_of_new_arrivals() {
        let buffer = BatchBuffer::with_batch_size(10);
        for n in 1..=3 {
            buffer.enqueue(record(n));
        }
        let batch = buffer.drain_for_flush();
        buffer.enqueue(record(4));

        let report = buffer.requeue(batch);
        assert_eq!(report.requeued, 3);
        assert_eq!(report.dead_lettered, 0);

        let again = buffer.drain_for_flush();
        assert_eq!(
            uris(again.records()),
            uris(&[record(1), record(2), record(3), record(4)])
        );
    }

    #[test]
    fn test_requeue_dead_letters_after_max_attempts() {
        let buffer = BatchBuffer::new(&BatchConfig {
            max_batch_size: 10,
            max_attempts: Some(2),
            ..BatchConfig::default()
        });
        buffer.enqueue(record(1));

        let report = buffer.requeue(buffer.drain_for_flush());
        assert_eq!(report.requeued, 1);

        let report = buffer.requeue(buffer.drain_for_flush());
        assert_eq!(report.requeued, 0);
        assert_eq!(report.dead_lettered, 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.dead_lettered(), 1);
    }

    #[test]
    fn test_bound_drops_oldest() {
        let buffer = BatchBuffer::new(&BatchConfig {
            max_batch_size: 2,
            max_buffered: Some(3),
            ..BatchConfig::default()
        });
        for n in 0..5 {
            buffer.enqueue(record(n));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.overflow_dropped(), 2);
        assert_eq!(buffer.drain_for_flush().records()[0].uri, record(2).uri);
    }

    #[test]
    fn test_take_indices() {
        let buffer = BatchBuffer::with_batch_size(10);
        for n in 0..4 {
            buffer.enqueue(record(n));
        }
        let mut batch = buffer.drain_for_flush();
        let taken = batch.take_indices(&[3, 1, 1, 9]);
        assert_eq!(uris(&taken), uris(&[record(1), record(3)]));
        assert_eq!(uris(batch.records()), uris(&[record(0), record(2)]));
    }
}
