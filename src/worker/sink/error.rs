//! Error types for persistence sinks.

use thiserror::Error;

/// Errors a sink can report for a whole batch.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The store answered with a retryable status.
    #[error("store unavailable (status {status}): {body}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The store refused the payload.
    #[error("payload rejected (status {status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Insert did not complete within the request timeout.
    #[error("insert timed out")]
    Timeout,

    /// `SQLite` storage error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    /// Record could not be serialized for the store.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sink misconfiguration detected at construction.
    #[error("sink configuration error: {0}")]
    Config(String),
}

impl SinkError {
    /// Whether a later attempt of the same batch may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpRequest(err) => !err.is_builder(),
            Self::Unavailable { .. } | Self::Timeout => true,
            Self::Sqlite(err) => is_busy(err),
            Self::Rejected { .. } | Self::Serialization(_) | Self::Config(_) => false,
        }
    }

    /// Short label for structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HttpRequest(_) => "http",
            Self::Unavailable { .. } => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::Timeout => "timeout",
            Self::Sqlite(_) => "sqlite",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}

/// Whether a `SQLite` error is lock contention rather than a problem with the row.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn is_busy(err: &tokio_rusqlite::Error) -> bool {
    matches!(err, tokio_rusqlite::Error::Rusqlite(inner) if is_contention(inner))
}

/// Convenience result alias for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let unavailable = SinkError::Unavailable {
            status: 503,
            body: String::new(),
        };
        let rejected = SinkError::Rejected {
            status: 400,
            body: String::new(),
        };
        assert!(unavailable.is_transient());
        assert!(SinkError::Timeout.is_transient());
        assert!(!rejected.is_transient());
        assert_eq!(rejected.kind(), "rejected");
    }

    #[test]
    fn test_sqlite_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(SinkError::Sqlite(tokio_rusqlite::Error::Rusqlite(busy)).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!SinkError::Sqlite(tokio_rusqlite::Error::Rusqlite(constraint)).is_transient());
        assert!(!SinkError::Sqlite(tokio_rusqlite::Error::ConnectionClosed).is_transient());
    }

    #[test]
    fn test_contention_covers_busy_and_locked_only() {
        let failure = |code| {
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
        };
        assert!(is_contention(&failure(rusqlite::ffi::SQLITE_BUSY)));
        assert!(is_contention(&failure(rusqlite::ffi::SQLITE_LOCKED)));
        assert!(!is_contention(&failure(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_contention(&rusqlite::Error::QueryReturnedNoRows));
    }
}
