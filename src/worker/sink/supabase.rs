//! Supabase sink over the PostgREST REST API.
//!
//! One POST per batch with `on_conflict=uri` and `resolution=ignore-duplicates`,
//! so replays of already-stored posts are no-ops on the server side. A `409`
//! counts as duplicates only when it reports a unique violation on `uri`.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::worker::core::config::SinkConfig;
use crate::worker::core::record::PostRecord;
use crate::worker::sink::error::{SinkError, SinkResult};
use crate::worker::sink::{InsertReport, PostSink, SinkFuture};

/// Maximum response body length kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Postgres `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Error body returned by PostgREST.
#[derive(Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Row shape of the destination table.
#[derive(Serialize)]
struct StoreRow<'a> {
    uri: &'a str,
    did: &'a str,
    text: &'a str,
    created_at: DateTime<Utc>,
    langs: &'a [String],
    facets: Option<&'a Value>,
    reply: Option<&'a Value>,
    embed: Option<&'a Value>,
    ingestion_time: DateTime<Utc>,
}

impl<'a> From<&'a PostRecord> for StoreRow<'a> {
    fn from(record: &'a PostRecord) -> Self {
        Self {
            uri: &record.uri,
            did: &record.author_id,
            text: &record.text,
            created_at: record.created_at,
            langs: &record.languages,
            facets: record.facets.as_ref(),
            // Replies never reach the sink.
            reply: None,
            embed: record.embed.as_ref(),
            ingestion_time: record.ingestion_time,
        }
    }
}

/// Batch inserter for a Supabase table.
pub struct SupabaseSink {
    client: reqwest::Client,
    endpoint: Url,
}

impl SupabaseSink {
    /// Build a sink from configuration.
    ///
    /// # Errors
    /// Returns an error if the URL or key is missing or the client cannot be built.
    pub fn new(config: &SinkConfig) -> SinkResult<Self> {
        let base_url = config
            .supabase_url
            .as_deref()
            .ok_or_else(|| SinkError::Config("SUPABASE_URL is not set".to_string()))?;
        let key = config
            .supabase_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SinkError::Config("SUPABASE_KEY is not set".to_string()))?;

        let endpoint = table_endpoint(base_url, &config.table)?;

        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(key)
            .map_err(|e| SinkError::Config(format!("invalid SUPABASE_KEY: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| SinkError::Config(format!("invalid SUPABASE_KEY: {e}")))?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Prefer",
            HeaderValue::from_static("return=minimal,resolution=ignore-duplicates"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .gzip(true)
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;

        Ok(Self { client, endpoint })
    }

    /// Insert endpoint for the configured table.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl PostSink for SupabaseSink {
    fn name(&self) -> &'static str {
        "supabase"
    }

    fn insert_batch<'a>(
        &'a self,
        records: &'a [PostRecord],
    ) -> SinkFuture<'a, SinkResult<InsertReport>> {
        Box::pin(async move {
            let rows: Vec<StoreRow<'_>> = records.iter().map(StoreRow::from).collect();
            let body = serde_json::to_vec(&rows)?;

            let response = self
                .client
                .post(self.endpoint.clone())
                .body(body)
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        SinkError::Timeout
                    } else {
                        SinkError::HttpRequest(err)
                    }
                })?;

            let status = response.status();
            let text = if status.is_success() {
                String::new()
            } else {
                response.text().await.unwrap_or_default()
            };
            debug!(status = status.as_u16(), rows = records.len(), "Supabase insert answered");
            interpret_status(status, &text, records.len())
        })
    }
}

/// Build `{base}/rest/v1/{table}?on_conflict=uri`.
fn table_endpoint(base_url: &str, table: &str) -> SinkResult<Url> {
    let base = Url::parse(base_url)
        .map_err(|e| SinkError::Config(format!("invalid SUPABASE_URL {base_url:?}: {e}")))?;
    let mut endpoint = base
        .join(&format!("rest/v1/{table}"))
        .map_err(|e| SinkError::Config(e.to_string()))?;
    endpoint.query_pairs_mut().append_pair("on_conflict", "uri");
    Ok(endpoint)
}

/// Map a response status onto the sink contract.
fn interpret_status(status: StatusCode, body: &str, batch_len: usize) -> SinkResult<InsertReport> {
    if status.is_success() {
        return Ok(InsertReport::inserted(batch_len));
    }

    if status == StatusCode::CONFLICT && is_uri_duplicate(body) {
        return Ok(InsertReport {
            inserted: 0,
            duplicates: batch_len,
            rejected: Vec::new(),
        });
    }

    let body = truncate(body);
    let code = status.as_u16();

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(SinkError::Unavailable { status: code, body });
    }

    Err(SinkError::Rejected { status: code, body })
}

/// Whether a conflict body reports a unique violation on the `uri` key.
///
/// Other conflicts (another unique index, a foreign key) are real rejections.
fn is_uri_duplicate(body: &str) -> bool {
    serde_json::from_str::<PostgrestError>(body).is_ok_and(|error| {
        error.code.as_deref() == Some(UNIQUE_VIOLATION)
            && error
                .details
                .as_deref()
                .is_some_and(|details| details.contains("(uri)="))
    })
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
