//! Canonical record persisted downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized post ready for bulk insertion.
///
/// `uri` is the store's unique key; redelivered events produce records with the
/// same `uri`, which the sinks treat as duplicates rather than failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    /// Unique resource identifier.
    pub uri: String,
    /// Author identifier (DID).
    #[serde(rename = "did")]
    pub author_id: String,
    /// Post text.
    pub text: String,
    /// Declared creation time, or stream-observed time when absent.
    pub created_at: DateTime<Utc>,
    /// Language codes in declaration order.
    #[serde(rename = "langs")]
    pub languages: Vec<String>,
    /// Rich-text facets, passed through untouched.
    pub facets: Option<serde_json::Value>,
    /// Embedded media reference, passed through untouched.
    pub embed: Option<serde_json::Value>,
    /// Time the record was normalized by this process.
    pub ingestion_time: DateTime<Utc>,
}
