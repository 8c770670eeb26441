//! Ingestion engine orchestration.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info};

use crate::worker::classify::RelevanceClassifier;
use crate::worker::core::config::IngestConfig;
use crate::worker::core::errors::IngestResult;
use crate::worker::pipeline::buffer::BatchBuffer;
use crate::worker::pipeline::event_loop::{EventLoop, LoopExit};
use crate::worker::pipeline::flusher::Flusher;
use crate::worker::pipeline::monitor::BufferMonitor;
use crate::worker::pipeline::scheduler::FlushScheduler;
use crate::worker::pipeline::stats::{IngestStats, StatsSnapshot};
use crate::worker::shutdown::{ShutdownCoordinator, ShutdownReport, Workers};
use crate::worker::sink::{PostSink, build_sink};
use crate::worker::source::{EventSource, build_source};

/// External endpoints of the engine.
pub struct IngestBackends {
    /// Upstream event source.
    pub source: Box<dyn EventSource>,
    /// Downstream store.
    pub sink: Arc<dyn PostSink>,
}

impl IngestBackends {
    /// Build the source and sink selected by configuration.
    ///
    /// # Errors
    /// Returns an error if either cannot be initialized.
    pub async fn from_config(config: &IngestConfig) -> IngestResult<Self> {
        let sink = build_sink(&config.sink).await?;
        let source = build_source(&config.stream).await?;
        Ok(Self { source, sink })
    }
}

/// Counters and shutdown details for one run.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RunSummary {
    /// Pipeline counters.
    pub stats: StatsSnapshot,
    /// Shutdown sequence details.
    pub shutdown: ShutdownReport,
}

/// Firehose ingestion engine: source, event loop, flush scheduler and sink.
pub struct IngestEngine {
    config: IngestConfig,
    classifier: Arc<RelevanceClassifier>,
    source: Box<dyn EventSource>,
    sink: Arc<dyn PostSink>,
}

impl IngestEngine {
    /// Create a new engine.
    ///
    /// # Errors
    /// Returns an error if configuration is invalid.
    pub fn new(config: IngestConfig, backends: IngestBackends) -> IngestResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: Arc::new(RelevanceClassifier::new()?),
            source: backends.source,
            sink: backends.sink,
        })
    }

    /// Create an engine with the backends selected by configuration.
    ///
    /// # Errors
    /// Returns an error if configuration is invalid or a backend cannot be built.
    pub async fn from_config(config: IngestConfig) -> IngestResult<Self> {
        let backends = IngestBackends::from_config(&config).await?;
        Self::new(config, backends)
    }

    /// Replace the keyword classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: RelevanceClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Run until `shutdown` resolves or the source is exhausted, then drain.
    ///
    /// Failures after startup are logged, never returned.
    pub async fn run<F>(self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()> + Send,
    {
        let config = &self.config;
        info!(
            source = self.source.name(),
            sink = self.sink.name(),
            max_batch_size = config.batch.max_batch_size,
            flush_interval_ms = config.batch.flush_interval_ms,
            keywords = self.classifier.len(),
            "Starting ingestion engine"
        );

        let buffer = Arc::new(BatchBuffer::new(&config.batch));
        let stats = Arc::new(IngestStats::new());
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&buffer),
            Arc::clone(&self.sink),
            Arc::clone(&stats),
            config.sink.request_timeout(),
        ));

        let scheduler = FlushScheduler::new(Arc::clone(&flusher), config.batch.flush_interval());
        let trigger = scheduler.trigger();
        let scheduler_stop = scheduler.shutdown_notifier();
        let scheduler = scheduler.spawn();

        let monitor = BufferMonitor::new(Arc::clone(&buffer), &config.monitor);
        let monitor_stop = monitor.shutdown_notifier();
        let monitor = monitor.spawn();

        let (tx, rx) = mpsc::channel(config.stream.channel_capacity);

        let event_loop_stop = Arc::new(Notify::new());
        let mut event_loop = EventLoop::new(
            Arc::clone(&self.classifier),
            Arc::clone(&buffer),
            trigger,
            Arc::clone(&stats),
            config.dedupe.capacity,
        )
        .spawn(rx, Arc::clone(&event_loop_stop));

        let source_stop = Arc::new(Notify::new());
        let source_name = self.source.name();
        let source = tokio::spawn(self.source.run(tx, Arc::clone(&source_stop)));

        let loop_finished = tokio::select! {
            () = shutdown => {
                info!("Shutdown requested");
                false
            }
            exit = &mut event_loop => {
                match exit {
                    Ok(LoopExit::SourceClosed) => info!(source = source_name, "Source exhausted"),
                    Ok(LoopExit::Stopped { .. }) => {}
                    Err(err) => error!(error = %err, "Event loop task failed"),
                }
                true
            }
        };

        let coordinator = ShutdownCoordinator::new(Arc::clone(&flusher), config.shutdown.drain_timeout());
        let report = coordinator
            .shutdown(Workers {
                source_stop,
                source,
                event_loop_stop,
                event_loop: (!loop_finished).then_some(event_loop),
                scheduler_stop,
                scheduler,
                monitor_stop,
                monitor,
            })
            .await;

        if let Some(source_stats) = report.source {
            source_stats.log_summary(source_name);
        }

        let summary = RunSummary {
            stats: stats.snapshot(buffer.dead_lettered(), buffer.overflow_dropped()),
            shutdown: report,
        };
        summary.stats.log_summary();
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    use tokio_rusqlite::Connection;

    use crate::worker::core::config::SinkKind;
    use crate::worker::sink::SqliteSink;
    use crate::worker::sink::testing::RecordingSink;
    use crate::worker::source::ReplaySource;

    fn commit_line(rkey: usize, text: &str) -> String {
        serde_json::json!({
            "did": "did:plc:engine",
            "time_us": 1_725_911_162_329_308_i64,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": rkey.to_string(),
                "record": {
                    "$type": "app.bsky.feed.post",
                    "text": text,
                    "createdAt": "2024-09-09T19:46:02.102Z"
                }
            }
        })
        .to_string()
    }

    fn replay(lines: &[String]) -> Box<dyn EventSource> {
        let input = lines.join("\n").into_bytes();
        Box::new(ReplaySource::from_reader(Cursor::new(input)))
    }

    fn config() -> IngestConfig {
        let mut config = IngestConfig::default();
        config.sink.kind = SinkKind::Sqlite;
        config
    }

    #[tokio::test]
    async fn test_replay_is_filtered_and_drained() {
        let lines = vec![
            commit_line(1, "my depression got worse"),
            commit_line(2, "great game last night"),
            commit_line(3, "first session with my therapist"),
            commit_line(1, "my depression got worse"),
        ];
        let sink = Arc::new(RecordingSink::new());
        let engine = IngestEngine::new(
            config(),
            IngestBackends {
                source: replay(&lines),
                sink: Arc::clone(&sink) as Arc<dyn PostSink>,
            },
        )
        .unwrap();

        let summary = engine.run(std::future::pending()).await;

        assert_eq!(sink.call_sizes(), vec![2]);
        assert_eq!(summary.stats.received, 4);
        assert_eq!(summary.stats.irrelevant, 1);
        assert_eq!(summary.stats.duplicates, 1);
        assert_eq!(summary.stats.persisted, 2);
        assert_eq!(summary.shutdown.undrained, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_and_drain_split_batches() {
        let lines: Vec<String> = (0..150)
            .map(|n| commit_line(n, "living with depression"))
            .collect();
        let sink = Arc::new(RecordingSink::new());
        let engine = IngestEngine::new(
            config(),
            IngestBackends {
                source: replay(&lines),
                sink: Arc::clone(&sink) as Arc<dyn PostSink>,
            },
        )
        .unwrap();

        engine.run(std::future::pending()).await;

        assert_eq!(sink.call_sizes(), vec![100, 50]);
        let mut uris: Vec<String> = sink.calls().into_iter().flatten().map(|r| r.uri).collect();
        uris.sort();
        uris.dedup();
        assert_eq!(uris.len(), 150);
    }

    #[tokio::test]
    async fn test_shutdown_signal_drains_partial_batch() {
        let sink = Arc::new(RecordingSink::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let (lines_tx, lines_rx) = tokio::io::duplex(64 * 1024);

        let engine = IngestEngine::new(
            config(),
            IngestBackends {
                source: Box::new(ReplaySource::from_reader(lines_rx)),
                sink: Arc::clone(&sink) as Arc<dyn PostSink>,
            },
        )
        .unwrap();

        let run = tokio::spawn(engine.run(async {
            let _ = rx.await;
        }));

        {
            use tokio::io::AsyncWriteExt;
            let mut writer = lines_tx;
            for n in 0..5 {
                let line = format!("{}\n", commit_line(n, "panic attack at work"));
                writer.write_all(line.as_bytes()).await.unwrap();
            }
            writer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(()).unwrap();
            let summary = run.await.unwrap();
            assert_eq!(summary.shutdown.drained_batches, 1);
            drop(writer);
        }

        assert_eq!(sink.call_sizes(), vec![5]);
    }

    #[tokio::test]
    async fn test_end_to_end_into_sqlite() {
        let conn = Connection::open_in_memory().await.unwrap();
        let sqlite = Arc::new(
            SqliteSink::from_connection(conn, "posts_unlabeled")
                .await
                .unwrap(),
        );
        let lines: Vec<String> = (0..12).map(|n| commit_line(n, "grief comes in waves")).collect();
        let mut config = config();
        config.batch.max_batch_size = 5;

        let engine = IngestEngine::new(
            config,
            IngestBackends {
                source: replay(&lines),
                sink: Arc::clone(&sqlite) as Arc<dyn PostSink>,
            },
        )
        .unwrap();
        let summary = engine.run(std::future::pending()).await;

        assert_eq!(sqlite.count().await.unwrap(), 12);
        assert_eq!(summary.stats.persisted, 12);
    }
}
