//! Receive loop turning stream events into buffered records.
//!
//! [`EventLoop::process_event`] is the whole per-event path (classify,
//! normalize, de-duplicate, enqueue) and never awaits. [`EventLoop::run`]
//! only adds the channel receive around it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::worker::classify::RelevanceClassifier;
use crate::worker::core::event::StreamEvent;
use crate::worker::pipeline::buffer::BatchBuffer;
use crate::worker::pipeline::normalizer::{Rejection, normalize_event};
use crate::worker::pipeline::scheduler::FlushTrigger;
use crate::worker::pipeline::stats::IngestStats;

/// What happened to one event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// No keyword matched.
    Irrelevant,
    /// The normalizer refused the event.
    Rejected(Rejection),
    /// The URI was enqueued recently.
    Duplicate,
    /// The record is buffered; `full` when this filled a batch.
    Enqueued {
        /// Whether an early flush was requested.
        full: bool,
    },
}

/// Why the receive loop ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopExit {
    /// The source dropped its sender.
    SourceClosed,
    /// A stop was requested.
    Stopped {
        /// Events left in the channel, never processed.
        unconsumed: usize,
    },
}

/// Per-event filtering and buffering.
pub struct EventLoop {
    classifier: Arc<RelevanceClassifier>,
    buffer: Arc<BatchBuffer>,
    trigger: FlushTrigger,
    stats: Arc<IngestStats>,
    recent: Option<LruCache<String, ()>>,
}

impl EventLoop {
    /// Create an event loop.
    ///
    /// `dedupe_capacity` is the number of recent URIs remembered; zero
    /// disables de-duplication.
    #[must_use]
    pub fn new(
        classifier: Arc<RelevanceClassifier>,
        buffer: Arc<BatchBuffer>,
        trigger: FlushTrigger,
        stats: Arc<IngestStats>,
        dedupe_capacity: usize,
    ) -> Self {
        Self {
            classifier,
            buffer,
            trigger,
            stats,
            recent: NonZeroUsize::new(dedupe_capacity).map(LruCache::new),
        }
    }

    /// Classify, normalize and enqueue one event.
    pub fn process_event(&mut self, event: &StreamEvent) -> Disposition {
        self.stats.add_received(1);

        if !event
            .text()
            .is_some_and(|text| self.classifier.is_relevant(text))
        {
            self.stats.add_irrelevant(1);
            return Disposition::Irrelevant;
        }

        let record = match normalize_event(event) {
            Ok(record) => record,
            Err(rejection) => {
                debug!(uri = %event.uri, reason = %rejection, "Event rejected");
                self.stats.add_rejected(1);
                return Disposition::Rejected(rejection);
            }
        };

        if let Some(recent) = self.recent.as_mut()
            && recent.put(record.uri.clone(), ()).is_some()
        {
            debug!(uri = %record.uri, "Dropping recently seen post");
            self.stats.add_duplicates(1);
            return Disposition::Duplicate;
        }

        let full = self.buffer.enqueue(record);
        self.stats.add_enqueued(1);
        if full {
            self.trigger.fire();
        }
        Disposition::Enqueued { full }
    }

    /// Process events until the channel closes or `stop` is notified.
    pub async fn run(mut self, mut events: mpsc::Receiver<StreamEvent>, stop: Arc<Notify>) -> LoopExit {
        info!("Event loop started");
        loop {
            tokio::select! {
                biased;
                () = stop.notified() => {
                    events.close();
                    let unconsumed = events.len();
                    if unconsumed > 0 {
                        warn!(unconsumed, "Event loop stopped with unprocessed events");
                    } else {
                        info!("Event loop stopped");
                    }
                    return LoopExit::Stopped { unconsumed };
                }
                received = events.recv() => {
                    let Some(event) = received else {
                        info!("Event source closed");
                        return LoopExit::SourceClosed;
                    };
                    self.process_event(&event);
                }
            }
        }
    }

    /// Spawn [`EventLoop::run`] as a tokio task.
    #[must_use]
    pub fn spawn(self, events: mpsc::Receiver<StreamEvent>, stop: Arc<Notify>) -> JoinHandle<LoopExit> {
        tokio::spawn(self.run(events, stop))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::worker::core::event::{EventKind, PostPayload};
    use std::time::Duration;

    struct Harness {
        event_loop: EventLoop,
        buffer: Arc<BatchBuffer>,
        stats: Arc<IngestStats>,
    }

    fn harness(batch_size: usize, dedupe: usize) -> Harness {
        let buffer = Arc::new(BatchBuffer::with_batch_size(batch_size));
        let stats = Arc::new(IngestStats::new());
        let classifier = Arc::new(RelevanceClassifier::new().unwrap());
        let event_loop = EventLoop::new(
            classifier,
            Arc::clone(&buffer),
            FlushTrigger::new(),
            Arc::clone(&stats),
            dedupe,
        );
        Harness {
            event_loop,
            buffer,
            stats,
        }
    }

    fn post(rkey: &str, text: &str) -> StreamEvent {
        StreamEvent::create("did:plc:author", rkey, PostPayload::post(text))
    }

    #[test]
    fn test_relevant_post_enqueued() {
        let mut h = harness(10, 0);
        let disposition = h.event_loop.process_event(&post("a", "my depression is back"));
        assert_eq!(disposition, Disposition::Enqueued { full: false });
        assert_eq!(h.buffer.len(), 1);
    }

    #[test]
    fn test_irrelevant_post_dropped() {
        let mut h = harness(10, 0);
        let disposition = h.event_loop.process_event(&post("a", "lovely weather today"));
        assert_eq!(disposition, Disposition::Irrelevant);
        assert!(h.buffer.is_empty());
        assert_eq!(h.stats.snapshot(0, 0).irrelevant, 1);
    }

    #[test]
    fn test_relevant_reply_rejected() {
        let mut h = harness(10, 0);
        let mut event = post("a", "therapy helped me");
        if let Some(record) = event.record.as_mut() {
            record.reply = Some(serde_json::json!({"parent": {}}));
        }
        assert_eq!(
            h.event_loop.process_event(&event),
            Disposition::Rejected(Rejection::Reply)
        );
        assert!(h.buffer.is_empty());
    }

    #[test]
    fn test_delete_is_irrelevant() {
        let mut h = harness(10, 0);
        let mut event = post("a", "anxiety");
        event.kind = EventKind::Delete;
        event.record = None;
        assert_eq!(h.event_loop.process_event(&event), Disposition::Irrelevant);
    }

    #[test]
    fn test_full_batch_reported() {
        let mut h = harness(2, 0);
        h.event_loop.process_event(&post("a", "anxiety"));
        let disposition = h.event_loop.process_event(&post("b", "anxiety"));
        assert_eq!(disposition, Disposition::Enqueued { full: true });
    }

    #[test]
    fn test_replayed_uri_deduplicated() {
        let mut h = harness(10, 16);
        h.event_loop.process_event(&post("a", "grief"));
        assert_eq!(
            h.event_loop.process_event(&post("a", "grief")),
            Disposition::Duplicate
        );
        assert_eq!(h.buffer.len(), 1);
        assert_eq!(h.stats.snapshot(0, 0).duplicates, 1);
    }

    #[test]
    fn test_dedupe_disabled_keeps_replays() {
        let mut h = harness(10, 0);
        h.event_loop.process_event(&post("a", "grief"));
        h.event_loop.process_event(&post("a", "grief"));
        assert_eq!(h.buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_run_ends_when_source_closes() {
        let h = harness(10, 0);
        let (tx, rx) = mpsc::channel(8);
        tx.send(post("a", "suicidal thoughts")).await.unwrap();
        tx.send(post("b", "nice cat")).await.unwrap();
        drop(tx);

        let exit = h.event_loop.run(rx, Arc::new(Notify::new())).await;
        assert_eq!(exit, LoopExit::SourceClosed);
        assert_eq!(h.buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_leaves_pending_events_unconsumed() {
        let h = harness(10, 0);
        let (tx, rx) = mpsc::channel(8);
        let stop = Arc::new(Notify::new());
        stop.notify_one();
        tx.send(post("a", "anxiety")).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(1), h.event_loop.run(rx, stop))
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::Stopped { unconsumed: 1 });
        assert!(h.buffer.is_empty());
        assert!(tx.is_closed());
    }
}
