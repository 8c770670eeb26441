//! Error types for the ingestion worker.

use thiserror::Error;

/// Ingestion worker error type.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Sink construction or storage error.
    #[error("sink error: {0}")]
    Sink(#[from] crate::worker::sink::SinkError),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// Regex compilation error.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;
