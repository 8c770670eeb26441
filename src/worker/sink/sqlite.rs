//! Local `SQLite` sink.
//!
//! Each batch is written in one transaction with `INSERT OR IGNORE`, keyed on
//! `uri`. A row that fails on its own is reported back by index; lock
//! contention fails the whole batch.

use tokio_rusqlite::Connection;
use tracing::debug;

use crate::worker::core::config::SinkConfig;
use crate::worker::core::record::PostRecord;
use crate::worker::sink::error::{SinkError, SinkResult, is_contention};
use crate::worker::sink::{InsertReport, PostSink, RejectedRecord, SinkFuture};

/// `SQLite` implementation of the post sink.
pub struct SqliteSink {
    conn: Connection,
    table: String,
}

impl SqliteSink {
    /// Open the configured database and ensure the table exists.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or initialized.
    pub async fn open(config: &SinkConfig) -> SinkResult<Self> {
        let conn = Connection::open(&config.sqlite_path).await?;
        Self::from_connection(conn, &config.table).await
    }

    /// Wrap an existing connection and ensure the table exists.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    pub async fn from_connection(conn: Connection, table: &str) -> SinkResult<Self> {
        let table = table.to_string();
        let table_name = table.clone();

        conn.call(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    uri TEXT PRIMARY KEY,
                    did TEXT NOT NULL,
                    text TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    langs TEXT NOT NULL,
                    facets TEXT,
                    reply TEXT,
                    embed TEXT,
                    ingestion_time TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table_name}_created_at
                    ON {table_name} (created_at);"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, table })
    }

    /// Number of stored rows.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count(&self) -> SinkResult<u64> {
        let table = self.table.clone();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
                Ok(count)
            })
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl PostSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn insert_batch<'a>(
        &'a self,
        records: &'a [PostRecord],
    ) -> SinkFuture<'a, SinkResult<InsertReport>> {
        Box::pin(async move {
            let table = self.table.clone();
            let records = records.to_vec();

            let report = self
                .conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    let mut report = InsertReport::default();
                    {
                        let mut stmt = tx.prepare(&format!(
                            "INSERT OR IGNORE INTO {table}
                            (uri, did, text, created_at, langs, facets, reply, embed, ingestion_time)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)"
                        ))?;

                        for (index, record) in records.iter().enumerate() {
                            let encoded = encode_json(record);
                            let (langs, facets, embed) = match encoded {
                                Ok(columns) => columns,
                                Err(err) => {
                                    report.rejected.push(RejectedRecord {
                                        index,
                                        reason: err.to_string(),
                                    });
                                    continue;
                                }
                            };

                            let result = stmt.execute(rusqlite::params![
                                record.uri,
                                record.author_id,
                                record.text,
                                record.created_at.to_rfc3339(),
                                langs,
                                facets,
                                embed,
                                record.ingestion_time.to_rfc3339(),
                            ]);

                            match result {
                                Ok(0) => report.duplicates += 1,
                                Ok(_) => report.inserted += 1,
                                Err(err) if is_contention(&err) => return Err(err.into()),
                                Err(err) => report.rejected.push(RejectedRecord {
                                    index,
                                    reason: err.to_string(),
                                }),
                            }
                        }
                    }
                    tx.commit()?;
                    Ok(report)
                })
                .await
                .map_err(SinkError::from)?;

            debug!(
                inserted = report.inserted,
                duplicates = report.duplicates,
                rejected = report.rejected.len(),
                "SQLite batch committed"
            );
            Ok(report)
        })
    }
}

type JsonColumns = (String, Option<String>, Option<String>);

fn encode_json(record: &PostRecord) -> Result<JsonColumns, serde_json::Error> {
    let langs = serde_json::to_string(&record.languages)?;
    let facets = record
        .facets
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let embed = record
        .embed
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok((langs, facets, embed))
}
