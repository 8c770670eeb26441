//! Mapping of accepted stream events into persisted records.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::worker::core::event::{EventKind, POST_COLLECTION, StreamEvent};
use crate::worker::core::record::PostRecord;

/// Reason an event was not turned into a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Rejection {
    /// Not a create operation.
    NotCreate,
    /// Record type tag is missing or not a post.
    WrongType,
    /// Replies are excluded; only top-level posts are kept.
    Reply,
    /// No text field on the record.
    MissingText,
    /// No author identifier on the event.
    MissingAuthor,
}

impl Rejection {
    /// Stable string form for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotCreate => "not_create",
            Self::WrongType => "wrong_type",
            Self::Reply => "reply",
            Self::MissingText => "missing_text",
            Self::MissingAuthor => "missing_author",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalize an event using the current time as ingestion time.
///
/// # Errors
/// Returns the rejection reason when the event is not a top-level post creation.
pub fn normalize_event(event: &StreamEvent) -> Result<PostRecord, Rejection> {
    normalize_event_at(event, Utc::now())
}

/// Normalize an event with an explicit ingestion time.
///
/// # Errors
/// Returns the rejection reason when the event is not a top-level post creation.
pub fn normalize_event_at(
    event: &StreamEvent,
    ingestion_time: DateTime<Utc>,
) -> Result<PostRecord, Rejection> {
    if event.kind != EventKind::Create {
        return Err(Rejection::NotCreate);
    }

    let Some(post) = event.record.as_ref() else {
        return Err(Rejection::MissingText);
    };

    if post.record_type.as_deref() != Some(POST_COLLECTION) {
        return Err(Rejection::WrongType);
    }

    if post.reply.is_some() {
        return Err(Rejection::Reply);
    }

    let Some(text) = post.text.as_ref() else {
        return Err(Rejection::MissingText);
    };

    let Some(author_id) = event.author.as_ref().filter(|a| !a.is_empty()) else {
        warn!(uri = %event.uri, "Post event without author identifier");
        return Err(Rejection::MissingAuthor);
    };

    let created_at = post
        .created_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(event.observed_at);

    Ok(PostRecord {
        uri: event.uri.clone(),
        author_id: author_id.clone(),
        text: text.clone(),
        created_at,
        languages: post.langs.clone().unwrap_or_default(),
        facets: post.facets.clone(),
        embed: post.embed.clone(),
        ingestion_time,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}
