//! Signal handling and the final drain.
//!
//! The coordinator moves `Running -> Draining -> Stopped` exactly once. While
//! draining it stops the source and the event loop, lets the scheduler finish
//! its current flush, then flushes what is left. All of it runs against one
//! deadline. Records still buffered or in flight after that are logged by URI,
//! counted as undrained and dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::worker::core::errors::IngestResult;
use crate::worker::pipeline::event_loop::LoopExit;
use crate::worker::pipeline::flusher::{FlushOutcome, Flusher};
use crate::worker::source::SourceStats;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

/// Poll delay while a scheduler flush still holds the in-progress flag.
const BUSY_RETRY: Duration = Duration::from_millis(10);

/// Lifecycle of the worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    /// Accepting and flushing events.
    Running,
    /// Shutdown requested; no new events, final flush in progress.
    Draining,
    /// Drain finished or abandoned.
    Stopped,
}

impl ShutdownState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            RUNNING => Self::Running,
            DRAINING => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Running tasks handed to the coordinator at shutdown.
pub struct Workers {
    /// Source stop notifier.
    pub source_stop: Arc<Notify>,
    /// Source task.
    pub source: JoinHandle<IngestResult<SourceStats>>,
    /// Event loop stop notifier.
    pub event_loop_stop: Arc<Notify>,
    /// Event loop task; `None` when it already ended.
    pub event_loop: Option<JoinHandle<LoopExit>>,
    /// Scheduler stop notifier.
    pub scheduler_stop: Arc<Notify>,
    /// Scheduler task.
    pub scheduler: JoinHandle<()>,
    /// Monitor stop notifier.
    pub monitor_stop: Arc<Notify>,
    /// Monitor task.
    pub monitor: JoinHandle<()>,
}

/// What the shutdown sequence observed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Events left in the channel when the event loop stopped.
    pub unconsumed_events: usize,
    /// Batches persisted during the final drain.
    pub drained_batches: usize,
    /// Records handed to the sink during the final drain.
    pub drained_records: usize,
    /// Records still buffered when the process gave up.
    pub undrained: usize,
    /// Whether the drain hit its timeout.
    pub timed_out: bool,
    /// Final counters of the source, when it ended cleanly.
    pub source: Option<SourceStats>,
}

/// Owns the shutdown state machine and the final drain.
pub struct ShutdownCoordinator {
    state: AtomicU8,
    flusher: Arc<Flusher>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator draining through `flusher`.
    #[must_use]
    pub const fn new(flusher: Arc<Flusher>, drain_timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            flusher,
            drain_timeout,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `Draining`; returns `false` if shutdown already began.
    pub fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop every task, drain the buffer and move to `Stopped`.
    ///
    /// The whole sequence shares one deadline of `drain_timeout`. Tasks still
    /// running at the deadline are aborted and awaited, so none of them can
    /// touch the buffer once the leftovers have been counted.
    pub async fn shutdown(&self, workers: Workers) -> ShutdownReport {
        if !self.begin_drain() {
            warn!(state = %self.state(), "Shutdown already in progress");
        }
        info!(drain_timeout = ?self.drain_timeout, "Draining pipeline");

        let deadline = Instant::now() + self.drain_timeout;
        let mut report = ShutdownReport::default();

        // Stop intake first so the buffer only shrinks from here on.
        workers.event_loop_stop.notify_one();
        workers.source_stop.notify_one();
        workers.monitor_stop.notify_one();

        if let Some(event_loop) = workers.event_loop {
            report.unconsumed_events = match join_until("event loop", deadline, event_loop).await {
                Joined::Done(LoopExit::Stopped { unconsumed }) => unconsumed,
                Joined::Done(LoopExit::SourceClosed) | Joined::Failed | Joined::Aborted => 0,
            };
        }

        report.source = match join_until("source", deadline, workers.source).await {
            Joined::Done(Ok(stats)) => Some(stats),
            Joined::Done(Err(err)) => {
                error!(error = %err, "Source ended with error");
                None
            }
            Joined::Failed | Joined::Aborted => None,
        };

        join_until("buffer monitor", deadline, workers.monitor).await;

        workers.scheduler_stop.notify_one();
        let drained = match join_until("flush scheduler", deadline, workers.scheduler).await {
            Joined::Aborted => false,
            Joined::Done(()) | Joined::Failed => {
                tokio::time::timeout_at(deadline, self.final_flush(&mut report))
                    .await
                    .is_ok()
            }
        };

        if !drained {
            report.timed_out = true;
            error!(
                drain_timeout = ?self.drain_timeout,
                "Final drain timed out, abandoning in-flight batch"
            );
        }

        report.undrained = self.discard_leftovers();

        self.state.store(STOPPED, Ordering::Release);
        info!(
            drained_batches = report.drained_batches,
            drained_records = report.drained_records,
            undrained = report.undrained,
            unconsumed_events = report.unconsumed_events,
            "Shutdown complete"
        );
        report
    }

    /// Log and drop what never reached the store; returns the number lost.
    fn discard_leftovers(&self) -> usize {
        let abandoned = self.flusher.take_in_flight();
        for uri in &abandoned {
            warn!(uri = %uri, "In-flight record lost at shutdown");
        }

        let buffer = self.flusher.buffer();
        let buffered = buffer.len();
        loop {
            let lost = buffer.drain_for_flush();
            if lost.is_empty() {
                break;
            }
            for record in lost.records() {
                warn!(uri = %record.uri, "Undrained record lost at shutdown");
            }
        }

        let undrained = abandoned.len() + buffered;
        if undrained > 0 {
            error!(
                undrained,
                in_flight = abandoned.len(),
                buffered,
                "Records lost at shutdown"
            );
        }
        undrained
    }

    /// Flush until the buffer is empty or a sink call fails.
    async fn final_flush(&self, report: &mut ShutdownReport) {
        loop {
            match self.flusher.attempt_flush().await {
                FlushOutcome::Empty => break,
                FlushOutcome::Persisted { size, .. } => {
                    report.drained_batches += 1;
                    report.drained_records += size;
                }
                FlushOutcome::Requeued { error, .. } => {
                    error!(error, "Final flush failed");
                    break;
                }
                FlushOutcome::Skipped => tokio::time::sleep(BUSY_RETRY).await,
            }
        }
    }
}

/// How a worker task ended.
enum Joined<T> {
    Done(T),
    Failed,
    Aborted,
}

/// Await `task` until `deadline`, then abort it and wait for the abort to land.
async fn join_until<T>(
    name: &'static str,
    deadline: Instant,
    mut task: JoinHandle<T>,
) -> Joined<T> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(value)) => Joined::Done(value),
        Ok(Err(err)) => {
            error!(task = name, error = %err, "Task failed");
            Joined::Failed
        }
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            task.abort();
            if let Some(err) = task.await.err().filter(|err| !err.is_cancelled()) {
                error!(task = name, error = %err, "Task failed while aborting");
            }
            Joined::Aborted
        }
    }
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
///
/// # Errors
/// Returns an error if signal handlers cannot be installed.
pub async fn wait_for_signal() -> IngestResult<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::worker::pipeline::buffer::BatchBuffer;
    use crate::worker::pipeline::buffer::tests::record;
    use crate::worker::pipeline::scheduler::FlushScheduler;
    use crate::worker::pipeline::stats::IngestStats;
    use crate::worker::sink::SinkError;
    use crate::worker::sink::testing::{RecordingSink, Scripted};

    fn idle_workers() -> Workers {
        let idle = || tokio::spawn(async {});
        Workers {
            source_stop: Arc::new(Notify::new()),
            source: tokio::spawn(async { Ok(SourceStats::default()) }),
            event_loop_stop: Arc::new(Notify::new()),
            event_loop: None,
            scheduler_stop: Arc::new(Notify::new()),
            scheduler: idle(),
            monitor_stop: Arc::new(Notify::new()),
            monitor: idle(),
        }
    }

    fn setup(
        batch_size: usize,
        sink: Arc<RecordingSink>,
        timeout: Duration,
    ) -> (Arc<BatchBuffer>, Arc<Flusher>, ShutdownCoordinator) {
        let buffer = Arc::new(BatchBuffer::with_batch_size(batch_size));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&buffer),
            sink,
            Arc::new(IngestStats::new()),
            Duration::from_secs(60),
        ));
        let coordinator = ShutdownCoordinator::new(Arc::clone(&flusher), timeout);
        (buffer, flusher, coordinator)
    }

    fn coordinator(
        batch_size: usize,
        sink: Arc<RecordingSink>,
        timeout: Duration,
    ) -> (Arc<BatchBuffer>, ShutdownCoordinator) {
        let (buffer, _flusher, coordinator) = setup(batch_size, sink, timeout);
        (buffer, coordinator)
    }

    #[tokio::test]
    async fn test_partial_batch_drained_in_one_call() {
        let sink = Arc::new(RecordingSink::new());
        let (buffer, coordinator) = coordinator(100, Arc::clone(&sink), Duration::from_secs(5));
        for n in 0..7 {
            buffer.enqueue(record(n));
        }

        assert_eq!(coordinator.state(), ShutdownState::Running);
        let report = coordinator.shutdown(idle_workers()).await;

        assert_eq!(sink.call_sizes(), vec![7]);
        assert_eq!(report.drained_batches, 1);
        assert_eq!(report.undrained, 0);
        assert!(!report.timed_out);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_backlog_drained_in_batches() {
        let sink = Arc::new(RecordingSink::new());
        let (buffer, coordinator) = coordinator(10, Arc::clone(&sink), Duration::from_secs(5));
        for n in 0..25 {
            buffer.enqueue(record(n));
        }

        coordinator.shutdown(idle_workers()).await;
        assert_eq!(sink.call_sizes(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_failed_final_flush_logs_and_drops() {
        let sink = Arc::new(RecordingSink::new());
        sink.push(Scripted::Fail(|| SinkError::Unavailable {
            status: 502,
            body: String::new(),
        }));
        let (buffer, coordinator) = coordinator(100, Arc::clone(&sink), Duration::from_secs(5));
        for n in 0..3 {
            buffer.enqueue(record(n));
        }

        let report = coordinator.shutdown(idle_workers()).await;
        assert_eq!(sink.call_sizes(), vec![3]);
        assert_eq!(report.undrained, 3);
        assert!(buffer.is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_final_flush_counts_in_flight_records() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(30)));
        let (buffer, flusher, coordinator) =
            setup(100, Arc::clone(&sink), Duration::from_secs(2));
        for n in 0..3 {
            buffer.enqueue(record(n));
        }

        let started = Instant::now();
        let report = coordinator.shutdown(idle_workers()).await;

        assert!(report.timed_out);
        assert_eq!(report.undrained, 3);
        assert_eq!(report.drained_records, 0);
        assert_eq!(sink.call_sizes(), vec![3]);
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(flusher.take_in_flight().is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stuck_in_flush_is_aborted_and_counted() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(30)));
        sink.push(Scripted::Fail(|| SinkError::Timeout));
        let (buffer, flusher, coordinator) =
            setup(100, Arc::clone(&sink), Duration::from_secs(2));

        let scheduler = FlushScheduler::new(Arc::clone(&flusher), Duration::from_secs(1));
        let scheduler_stop = scheduler.shutdown_notifier();
        let scheduler = scheduler.spawn();
        for n in 0..3 {
            buffer.enqueue(record(n));
        }
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(flusher.is_flushing());

        let report = coordinator
            .shutdown(Workers {
                scheduler_stop,
                scheduler,
                ..idle_workers()
            })
            .await;

        assert!(report.timed_out);
        assert_eq!(report.undrained, 3);

        // The aborted flush never comes back to requeue its batch.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(buffer.is_empty());
        assert_eq!(sink.call_sizes(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_source_shares_the_deadline() {
        let sink = Arc::new(RecordingSink::new());
        let (buffer, coordinator) = coordinator(100, Arc::clone(&sink), Duration::from_secs(2));
        buffer.enqueue(record(0));

        let started = Instant::now();
        let report = coordinator
            .shutdown(Workers {
                source: tokio::spawn(std::future::pending::<IngestResult<SourceStats>>()),
                ..idle_workers()
            })
            .await;

        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(report.source.is_none());
        assert_eq!(report.undrained + report.drained_records, 1);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[test]
    fn test_begin_drain_only_once() {
        let sink = Arc::new(RecordingSink::new());
        let (_buffer, coordinator) = coordinator(10, sink, Duration::from_secs(1));
        assert!(coordinator.begin_drain());
        assert!(!coordinator.begin_drain());
        assert_eq!(coordinator.state(), ShutdownState::Draining);
    }
}
