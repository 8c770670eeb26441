//! Decoded upstream events consumed by the pipeline.
//!
//! A `StreamEvent` is transport-agnostic: the Jetstream and replay sources both
//! decode into it, and nothing downstream knows which one produced it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection and record type tag for top-level posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Kind of repository operation carried by an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new record was created.
    Create,
    /// An existing record was updated.
    Update,
    /// A record was deleted.
    Delete,
}

impl EventKind {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(value.to_string()),
        }
    }
}

/// Post record body as published by the author.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    /// Declared record type tag.
    #[serde(rename = "$type", default)]
    pub record_type: Option<String>,
    /// Post text.
    #[serde(default)]
    pub text: Option<String>,
    /// Author-declared creation time, as published.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Reply reference; present only on replies.
    #[serde(default)]
    pub reply: Option<serde_json::Value>,
    /// Embedded media reference.
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
    /// Language tags.
    #[serde(default)]
    pub langs: Option<Vec<String>>,
    /// Rich-text facets.
    #[serde(default)]
    pub facets: Option<serde_json::Value>,
}

/// One decoded post notification from the upstream stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Repository operation.
    pub kind: EventKind,
    /// Author identifier (DID), when known.
    pub author: Option<String>,
    /// Collection the record belongs to.
    pub collection: String,
    /// Globally unique resource identifier.
    pub uri: String,
    /// Time the stream observed the event.
    pub observed_at: DateTime<Utc>,
    /// Record body; absent on deletes.
    pub record: Option<PostPayload>,
}

impl StreamEvent {
    /// Build a create event for a post.
    #[must_use]
    pub fn create(author: impl Into<String>, rkey: &str, record: PostPayload) -> Self {
        let author = author.into();
        Self {
            kind: EventKind::Create,
            uri: format!("at://{author}/{POST_COLLECTION}/{rkey}"),
            author: Some(author),
            collection: POST_COLLECTION.to_string(),
            observed_at: Utc::now(),
            record: Some(record),
        }
    }

    /// Post text, if the event carries one.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.record.as_ref().and_then(|r| r.text.as_deref())
    }
}

impl PostPayload {
    /// Build a minimal top-level post body.
    #[must_use]
    pub fn post(text: impl Into<String>) -> Self {
        Self {
            record_type: Some(POST_COLLECTION.to_string()),
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_deserializes_camel_case() {
        let json = r#"{
            "$type": "app.bsky.feed.post",
            "text": "hello",
            "createdAt": "2024-09-09T19:46:02.102Z",
            "langs": ["en"],
            "reply": null
        }"#;
        let payload: PostPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.record_type.as_deref(), Some(POST_COLLECTION));
        assert_eq!(payload.created_at.as_deref(), Some("2024-09-09T19:46:02.102Z"));
        assert_eq!(payload.langs, Some(vec!["en".to_string()]));
        assert!(payload.reply.is_none());
    }

    #[test]
    fn test_create_builds_uri() {
        let event = StreamEvent::create("did:plc:abc", "3l3qo2vutsw2b", PostPayload::post("hi"));
        assert_eq!(event.uri, "at://did:plc:abc/app.bsky.feed.post/3l3qo2vutsw2b");
        assert_eq!(event.text(), Some("hi"));
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [EventKind::Create, EventKind::Update, EventKind::Delete] {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("upsert".parse::<EventKind>().is_err());
    }
}
