//! Bluesky Jetstream websocket source.
//!
//! Subscribes to `app.bsky.feed.post` commits and reconnects with jittered
//! exponential backoff, resuming from the last `time_us` seen.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::worker::core::errors::IngestResult;
use crate::worker::core::event::{EventKind, POST_COLLECTION, PostPayload, StreamEvent};
use crate::worker::source::{Delivery, EventSource, SourceFuture, SourceStats, deliver};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    did: Option<String>,
    #[serde(default)]
    time_us: Option<i64>,
    kind: String,
    #[serde(default)]
    commit: Option<WireCommit>,
}

#[derive(Deserialize)]
struct WireCommit {
    operation: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<PostPayload>,
}

/// One decoded Jetstream message.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    /// Stream position of the message, usable as a resume cursor.
    pub cursor: Option<i64>,
    /// Post event, when the message is a post commit.
    pub event: Option<StreamEvent>,
}

/// Decode one Jetstream JSON message.
///
/// Identity and account messages, and commits outside the post collection,
/// decode to `event: None`.
///
/// # Errors
/// Returns an error if the message is not valid Jetstream JSON.
pub fn decode_message(raw: &str) -> IngestResult<Decoded> {
    let message: WireMessage = serde_json::from_str(raw)?;
    let cursor = message.time_us;

    let commit = match message.commit {
        Some(commit) if message.kind == "commit" => commit,
        _ => return Ok(Decoded { cursor, event: None }),
    };

    if commit.collection != POST_COLLECTION {
        return Ok(Decoded { cursor, event: None });
    }

    let Ok(kind) = commit.operation.parse::<EventKind>() else {
        debug!(operation = %commit.operation, "Unknown commit operation");
        return Ok(Decoded { cursor, event: None });
    };

    let author = message.did.filter(|did| !did.is_empty());
    let uri = format!(
        "at://{}/{}/{}",
        author.as_deref().unwrap_or_default(),
        commit.collection,
        commit.rkey
    );
    let observed_at = cursor
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .unwrap_or_else(Utc::now);

    Ok(Decoded {
        cursor,
        event: Some(StreamEvent {
            kind,
            author,
            collection: commit.collection,
            uri,
            observed_at,
            record: commit.record,
        }),
    })
}

/// Why one websocket session ended.
enum Session {
    Stopped,
    Closed,
    Disconnected(String),
}

/// Live Jetstream subscription.
pub struct JetstreamSource {
    endpoint: Url,
    cursor: Option<i64>,
}

impl JetstreamSource {
    /// Create a source for a Jetstream subscribe endpoint.
    ///
    /// # Errors
    /// Returns an error if the endpoint is not a valid URL.
    pub fn new(endpoint: &str) -> IngestResult<Self> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            cursor: None,
        })
    }

    /// Subscribe URL for the current cursor.
    #[must_use]
    pub fn subscribe_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("wantedCollections", POST_COLLECTION);
            if let Some(cursor) = self.cursor {
                params.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }

    async fn run_inner(
        mut self,
        events: mpsc::Sender<StreamEvent>,
        stop: Arc<Notify>,
    ) -> IngestResult<SourceStats> {
        let mut stats = SourceStats::default();
        let mut failures: u32 = 0;

        loop {
            let url = self.subscribe_url();
            info!(url = %url, "Connecting to Jetstream");

            let connected = tokio::select! {
                biased;
                () = stop.notified() => break,
                connected = tokio_tungstenite::connect_async(url.as_str()) => connected,
            };

            match connected {
                Ok((stream, _)) => {
                    info!("Jetstream connected");
                    failures = 0;
                    match self.consume(stream, &events, &stop, &mut stats).await {
                        Session::Stopped => break,
                        Session::Closed => {
                            info!("Pipeline channel closed, leaving Jetstream");
                            break;
                        }
                        Session::Disconnected(reason) => {
                            warn!(reason, cursor = ?self.cursor, "Jetstream disconnected");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Jetstream connection failed");
                }
            }

            failures = failures.saturating_add(1);
            stats.reconnects += 1;
            let delay = backoff_delay(failures);
            debug!(?delay, failures, "Waiting before reconnect");

            tokio::select! {
                biased;
                () = stop.notified() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        Ok(stats)
    }

    async fn consume<S>(
        &mut self,
        mut stream: S,
        events: &mpsc::Sender<StreamEvent>,
        stop: &Notify,
        stats: &mut SourceStats,
    ) -> Session
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = stop.notified() => return Session::Stopped,
                next = stream.next() => next,
            };

            let text = match next {
                None => return Session::Disconnected("stream ended".to_string()),
                Some(Err(err)) => return Session::Disconnected(err.to_string()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    return Session::Disconnected(format!("closed by server: {frame:?}"));
                }
                Some(Ok(_)) => continue,
            };

            stats.messages += 1;
            let decoded = match decode_message(text.as_str()) {
                Ok(decoded) => decoded,
                Err(err) => {
                    stats.decode_errors += 1;
                    warn!(error = %err, "Skipping undecodable Jetstream message");
                    continue;
                }
            };

            if let Some(cursor) = decoded.cursor {
                self.cursor = Some(cursor);
            }
            let Some(event) = decoded.event else {
                continue;
            };

            match deliver(events, stop, event).await {
                Delivery::Sent => stats.events += 1,
                Delivery::Stopped => return Session::Stopped,
                Delivery::Closed => return Session::Closed,
            }
        }
    }
}

impl EventSource for JetstreamSource {
    fn name(&self) -> &'static str {
        "jetstream"
    }

    fn run(
        self: Box<Self>,
        events: mpsc::Sender<StreamEvent>,
        stop: Arc<Notify>,
    ) -> SourceFuture<IngestResult<SourceStats>> {
        Box::pin((*self).run_inner(events, stop))
    }
}

/// Exponential backoff with up to 50% added jitter, capped at one minute.
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    let base = BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_MAX);
    let max_jitter = u64::try_from(base.as_millis() / 2).unwrap_or(0);
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base.saturating_add(Duration::from_millis(jitter))
        .min(BACKOFF_MAX)
}
