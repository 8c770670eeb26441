//! Upstream event sources.
//!
//! A source decodes its transport into [`StreamEvent`]s and pushes them into
//! the pipeline channel. It stops when the stop notifier fires, when the
//! channel closes, or (for finite sources) at end of input; dropping the
//! sender is what tells the event loop that no more events will come.

pub mod jetstream;
pub mod replay;

pub use jetstream::{Decoded, JetstreamSource, decode_message};
pub use replay::ReplaySource;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::info;

use crate::worker::core::config::{SourceKind, StreamConfig};
use crate::worker::core::errors::{IngestError, IngestResult};
use crate::worker::core::event::StreamEvent;

/// Boxed future returned by [`EventSource::run`].
pub type SourceFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A producer of stream events.
pub trait EventSource: Send {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Deliver events into `events` until stopped or exhausted.
    ///
    /// # Errors
    /// Returns an error only for failures the source cannot recover from.
    fn run(
        self: Box<Self>,
        events: mpsc::Sender<StreamEvent>,
        stop: Arc<Notify>,
    ) -> SourceFuture<IngestResult<SourceStats>>;
}

/// Counters from one source run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SourceStats {
    /// Raw messages read from the transport.
    pub messages: u64,
    /// Events handed to the pipeline.
    pub events: u64,
    /// Messages that could not be decoded and were skipped.
    pub decode_errors: u64,
    /// Reconnections after a dropped connection.
    pub reconnects: u64,
}

impl SourceStats {
    /// Log the counters at the end of a run.
    pub fn log_summary(&self, source: &str) {
        info!(
            source,
            messages = self.messages,
            events = self.events,
            decode_errors = self.decode_errors,
            reconnects = self.reconnects,
            "Source finished"
        );
    }
}

/// Outcome of handing one event to the pipeline.
pub(crate) enum Delivery {
    Sent,
    Stopped,
    Closed,
}

/// Send an event, giving up if `stop` fires while the channel is full.
pub(crate) async fn deliver(
    events: &mpsc::Sender<StreamEvent>,
    stop: &Notify,
    event: StreamEvent,
) -> Delivery {
    tokio::select! {
        biased;
        () = stop.notified() => Delivery::Stopped,
        sent = events.send(event) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}

/// Build the source selected by configuration.
///
/// # Errors
/// Returns an error if the source cannot be opened.
pub async fn build_source(config: &StreamConfig) -> IngestResult<Box<dyn EventSource>> {
    match config.source {
        SourceKind::Jetstream => Ok(Box::new(JetstreamSource::new(&config.jetstream_url)?)),
        SourceKind::Replay => {
            let path = config.replay_path.as_ref().ok_or_else(|| {
                IngestError::InvalidConfig("replay source requires a path".to_string())
            })?;
            Ok(Box::new(ReplaySource::open(path).await?))
        }
    }
}
