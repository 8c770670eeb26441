//! Configuration for the ingestion worker.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::worker::core::errors::{IngestError, IngestResult};

/// Default Jetstream endpoint.
pub const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Top-level configuration for the ingestion worker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Batching and flush settings.
    pub batch: BatchConfig,
    /// Upstream stream settings.
    pub stream: StreamConfig,
    /// Downstream store settings.
    pub sink: SinkConfig,
    /// Shutdown drain settings.
    pub shutdown: ShutdownConfig,
    /// Replay de-duplication settings.
    pub dedupe: DedupeConfig,
    /// Backlog monitor settings.
    pub monitor: MonitorConfig,
}

impl IngestConfig {
    /// Build a configuration from the process environment.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> IngestResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; set keys must parse.
    ///
    /// # Errors
    /// Returns an error if a value cannot be parsed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> IngestResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MH_WORKER_MAX_BATCH_SIZE")? {
            config.batch.max_batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "MH_WORKER_FLUSH_INTERVAL_MS")? {
            config.batch.flush_interval_ms = v;
        }
        config.batch.max_attempts = parse_var(&lookup, "MH_WORKER_MAX_ATTEMPTS")?;
        config.batch.max_buffered = parse_var(&lookup, "MH_WORKER_MAX_BUFFERED")?;

        if let Some(v) = parse_var(&lookup, "MH_WORKER_SOURCE")? {
            config.stream.source = v;
        }
        if let Some(v) = lookup("MH_WORKER_JETSTREAM_URL") {
            config.stream.jetstream_url = v;
        }
        config.stream.replay_path = lookup("MH_WORKER_REPLAY_PATH").map(PathBuf::from);
        if let Some(v) = parse_var(&lookup, "MH_WORKER_CHANNEL_CAPACITY")? {
            config.stream.channel_capacity = v;
        }

        if let Some(v) = parse_var(&lookup, "MH_WORKER_SINK")? {
            config.sink.kind = v;
        }
        config.sink.supabase_url = lookup("SUPABASE_URL");
        config.sink.supabase_key = lookup("SUPABASE_KEY");
        if let Some(v) = lookup("MH_WORKER_TABLE") {
            config.sink.table = v;
        }
        if let Some(v) = lookup("MH_WORKER_SQLITE_PATH") {
            config.sink.sqlite_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&lookup, "MH_WORKER_SINK_TIMEOUT_MS")? {
            config.sink.request_timeout_ms = v;
        }

        if let Some(v) = parse_var(&lookup, "MH_WORKER_DRAIN_TIMEOUT_MS")? {
            config.shutdown.drain_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MH_WORKER_DEDUPE_CAPACITY")? {
            config.dedupe.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "MH_WORKER_MONITOR_INTERVAL_MS")? {
            config.monitor.interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MH_WORKER_BUFFER_WARN")? {
            config.monitor.warn_threshold = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> IngestResult<()> {
        if self.batch.max_batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "batch.max_batch_size must be > 0".to_string(),
            ));
        }

        if self.batch.flush_interval_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "batch.flush_interval_ms must be > 0".to_string(),
            ));
        }

        if self.batch.max_attempts == Some(0) {
            return Err(IngestError::InvalidConfig(
                "batch.max_attempts must be > 0 when set".to_string(),
            ));
        }

        if let Some(max_buffered) = self.batch.max_buffered
            && max_buffered < self.batch.max_batch_size
        {
            return Err(IngestError::InvalidConfig(format!(
                "batch.max_buffered ({max_buffered}) must be >= batch.max_batch_size ({})",
                self.batch.max_batch_size
            )));
        }

        if self.stream.channel_capacity == 0 {
            return Err(IngestError::InvalidConfig(
                "stream.channel_capacity must be > 0".to_string(),
            ));
        }

        match self.stream.source {
            SourceKind::Jetstream => {
                let url = Url::parse(&self.stream.jetstream_url)?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(IngestError::InvalidConfig(format!(
                        "stream.jetstream_url must use ws or wss, got {}",
                        url.scheme()
                    )));
                }
            }
            SourceKind::Replay => {
                if self.stream.replay_path.is_none() {
                    return Err(IngestError::InvalidConfig(
                        "stream.replay_path is required for the replay source".to_string(),
                    ));
                }
            }
        }

        match self.sink.kind {
            SinkKind::Supabase => {
                let Some(base_url) = &self.sink.supabase_url else {
                    return Err(IngestError::InvalidConfig(
                        "SUPABASE_URL is required for the supabase sink".to_string(),
                    ));
                };
                Url::parse(base_url)?;
                if self.sink.supabase_key.as_deref().is_none_or(str::is_empty) {
                    return Err(IngestError::InvalidConfig(
                        "SUPABASE_KEY is required for the supabase sink".to_string(),
                    ));
                }
            }
            SinkKind::Sqlite => {}
        }

        if self.sink.table.is_empty()
            || !self
                .sink
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(IngestError::InvalidConfig(format!(
                "sink.table must be a plain identifier, got {:?}",
                self.sink.table
            )));
        }

        if self.sink.request_timeout_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "sink.request_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.shutdown.drain_timeout_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "shutdown.drain_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.monitor.interval_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "monitor.interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> IngestResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| IngestError::InvalidConfig(format!("{key}={raw:?}: {err}")))
        })
        .transpose()
}

/// Batching and flush settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Records per bulk insert; reaching it triggers an early flush.
    pub max_batch_size: usize,
    /// Periodic flush cadence in milliseconds.
    pub flush_interval_ms: u64,
    /// Failed attempts after which a record is dead-lettered (unset = retry forever).
    pub max_attempts: Option<u32>,
    /// Upper bound on buffered records (unset = bounded only by memory).
    pub max_buffered: Option<usize>,
}

impl BatchConfig {
    /// Flush interval as a `Duration`.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval_ms: 5_000,
            max_attempts: None,
            max_buffered: None,
        }
    }
}

/// Upstream source selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Live Bluesky Jetstream websocket.
    Jetstream,
    /// JSONL file of Jetstream messages.
    Replay,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "jetstream" => Ok(Self::Jetstream),
            "replay" => Ok(Self::Replay),
            other => Err(format!("unknown source {other:?} (expected jetstream or replay)")),
        }
    }
}

/// Upstream stream settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Which source feeds the pipeline.
    pub source: SourceKind,
    /// Jetstream subscribe endpoint.
    pub jetstream_url: String,
    /// JSONL file for the replay source.
    pub replay_path: Option<PathBuf>,
    /// Capacity of the source → event loop channel.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Jetstream,
            jetstream_url: DEFAULT_JETSTREAM_URL.to_string(),
            replay_path: None,
            channel_capacity: 1024,
        }
    }
}

/// Downstream store selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Supabase table through the PostgREST API.
    Supabase,
    /// Local `SQLite` database.
    Sqlite,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "supabase" => Ok(Self::Supabase),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown sink {other:?} (expected supabase or sqlite)")),
        }
    }
}

/// Downstream store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Which store receives batches.
    pub kind: SinkKind,
    /// Supabase project URL.
    pub supabase_url: Option<String>,
    /// Supabase service key.
    pub supabase_key: Option<String>,
    /// Destination table.
    pub table: String,
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl SinkConfig {
    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Supabase,
            supabase_url: None,
            supabase_key: None,
            table: "posts_unlabeled".to_string(),
            sqlite_path: PathBuf::from("posts.sqlite"),
            request_timeout_ms: 10_000,
        }
    }
}

/// Shutdown drain settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on the whole shutdown sequence, in milliseconds.
    ///
    /// Stopping the source, event loop, monitor and scheduler and the final
    /// flush all share this one deadline; tasks still running at it are aborted.
    pub drain_timeout_ms: u64,
}

impl ShutdownConfig {
    /// Drain timeout as a `Duration`.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}

/// Replay de-duplication settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Number of recent URIs remembered (0 disables).
    pub capacity: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Backlog monitor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Check cadence in milliseconds.
    pub interval_ms: u64,
    /// Buffered record count above which a warning is logged.
    pub warn_threshold: usize,
}

impl MonitorConfig {
    /// Check cadence as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            warn_threshold: 1_000,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn supabase_pairs() -> Vec<(&'static str, &'static str)> {
        vec![
            ("SUPABASE_URL", "https://project.supabase.co"),
            ("SUPABASE_KEY", "service-key"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.batch.flush_interval_ms, 5_000);
        assert!(config.batch.max_attempts.is_none());
        assert_eq!(config.sink.table, "posts_unlabeled");
        assert_eq!(config.stream.source, SourceKind::Jetstream);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let mut pairs = supabase_pairs();
        pairs.push(("MH_WORKER_MAX_BATCH_SIZE", "250"));
        pairs.push(("MH_WORKER_FLUSH_INTERVAL_MS", " 2000 "));
        pairs.push(("MH_WORKER_MAX_ATTEMPTS", "3"));
        let config = IngestConfig::from_lookup(lookup_from(&pairs)).unwrap();

        assert_eq!(config.batch.max_batch_size, 250);
        assert_eq!(config.batch.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.batch.max_attempts, Some(3));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut pairs = supabase_pairs();
        pairs.push(("MH_WORKER_MAX_BATCH_SIZE", "0"));
        let err = IngestConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_non_numeric_interval_rejected() {
        let mut pairs = supabase_pairs();
        pairs.push(("MH_WORKER_FLUSH_INTERVAL_MS", "soon"));
        let err = IngestConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("MH_WORKER_FLUSH_INTERVAL_MS"));
    }

    #[test]
    fn test_negative_batch_size_rejected() {
        let mut pairs = supabase_pairs();
        pairs.push(("MH_WORKER_MAX_BATCH_SIZE", "-5"));
        assert!(IngestConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn test_supabase_requires_credentials() {
        let err = IngestConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("SUPABASE_URL"));
    }

    #[test]
    fn test_sqlite_replay_config() {
        let pairs = [
            ("MH_WORKER_SINK", "sqlite"),
            ("MH_WORKER_SOURCE", "replay"),
            ("MH_WORKER_REPLAY_PATH", "/tmp/posts.jsonl"),
        ];
        let config = IngestConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.sink.kind, SinkKind::Sqlite);
        assert_eq!(config.stream.source, SourceKind::Replay);
        assert_eq!(
            config.stream.replay_path,
            Some(PathBuf::from("/tmp/posts.jsonl"))
        );
    }

    #[test]
    fn test_replay_requires_path() {
        let pairs = [("MH_WORKER_SINK", "sqlite"), ("MH_WORKER_SOURCE", "replay")];
        assert!(IngestConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn test_buffer_bound_below_batch_rejected() {
        let mut config = IngestConfig::default();
        config.sink.kind = SinkKind::Sqlite;
        config.batch.max_buffered = Some(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_table_must_be_identifier() {
        let mut config = IngestConfig::default();
        config.sink.kind = SinkKind::Sqlite;
        config.sink.table = "posts; DROP TABLE posts".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_jetstream_url_rejected() {
        let mut config = IngestConfig::default();
        config.sink.kind = SinkKind::Sqlite;
        config.stream.jetstream_url = "https://example.com/subscribe".to_string();
        assert!(config.validate().is_err());
    }
}
