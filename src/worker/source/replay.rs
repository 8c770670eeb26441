//! JSONL replay of recorded Jetstream messages.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Notify, mpsc};
use tracing::{info, warn};

use crate::worker::core::errors::IngestResult;
use crate::worker::core::event::StreamEvent;
use crate::worker::source::jetstream::decode_message;
use crate::worker::source::{Delivery, EventSource, SourceFuture, SourceStats, deliver};

/// Finite source reading one Jetstream message per line.
pub struct ReplaySource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    label: String,
}

impl ReplaySource {
    /// Open a JSONL file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path) -> IngestResult<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            reader: Box::new(file),
            label: path.display().to_string(),
        })
    }

    /// Read messages from any async reader.
    #[must_use]
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            label: "<reader>".to_string(),
        }
    }

    async fn run_inner(
        self,
        events: mpsc::Sender<StreamEvent>,
        stop: Arc<Notify>,
    ) -> IngestResult<SourceStats> {
        info!(input = %self.label, "Replaying recorded stream");
        let mut lines = BufReader::new(self.reader).lines();
        let mut stats = SourceStats::default();
        let mut line_no: u64 = 0;

        loop {
            let line = tokio::select! {
                biased;
                () = stop.notified() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                info!(input = %self.label, lines = line_no, "Replay reached end of input");
                break;
            };
            line_no += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            stats.messages += 1;

            let event = match decode_message(line) {
                Ok(decoded) => decoded.event,
                Err(err) => {
                    stats.decode_errors += 1;
                    warn!(line = line_no, error = %err, "Skipping undecodable line");
                    continue;
                }
            };
            let Some(event) = event else {
                continue;
            };

            match deliver(&events, &stop, event).await {
                Delivery::Sent => stats.events += 1,
                Delivery::Stopped | Delivery::Closed => break,
            }
        }

        Ok(stats)
    }
}

impl EventSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn run(
        self: Box<Self>,
        events: mpsc::Sender<StreamEvent>,
        stop: Arc<Notify>,
    ) -> SourceFuture<IngestResult<SourceStats>> {
        Box::pin((*self).run_inner(events, stop))
    }
}
