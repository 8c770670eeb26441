//! Timer-driven flush task with an early-flush trigger.
//!
//! The scheduler owns the only long-lived flush context. It wakes on its
//! interval or when the event loop reports a full buffer, and in both cases
//! calls the shared [`Flusher`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::worker::pipeline::flusher::{FlushOutcome, Flusher};

/// Handle used by the event loop to request an early flush.
///
/// Signals coalesce: firing several times before the scheduler wakes results
/// in one flush cycle.
#[derive(Clone, Debug, Default)]
pub struct FlushTrigger {
    notify: Arc<Notify>,
}

impl FlushTrigger {
    /// Create an unconnected trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a flush.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await;
    }
}

/// Periodic flush worker.
pub struct FlushScheduler {
    flusher: Arc<Flusher>,
    interval: Duration,
    trigger: FlushTrigger,
    shutdown: Arc<Notify>,
}

impl FlushScheduler {
    /// Create a scheduler flushing every `interval`.
    #[must_use]
    pub fn new(flusher: Arc<Flusher>, interval: Duration) -> Self {
        Self {
            flusher,
            interval,
            trigger: FlushTrigger::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Trigger wired to this scheduler.
    #[must_use]
    pub fn trigger(&self) -> FlushTrigger {
        self.trigger.clone()
    }

    /// Get a shutdown notifier to stop the scheduler.
    ///
    /// Use `notify_one` so a stop requested mid-flush is not lost; the
    /// running flush completes before the task exits.
    #[must_use]
    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawn the scheduler as a tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval = ?self.interval, "Starting flush scheduler");

        // First tick one interval from now, not immediately.
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.notified() => {
                    info!("Flush scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("Interval flush");
                    let outcome = self.flusher.attempt_flush().await;
                    if outcome.is_persisted() {
                        self.drain_full_batches().await;
                    }
                }
                () = self.trigger.fired() => {
                    debug!("Fill-triggered flush");
                    self.drain_full_batches().await;
                }
            }
        }
    }

    /// Flush while at least one full batch is waiting and the sink keeps succeeding.
    async fn drain_full_batches(&self) {
        while self.flusher.buffer().has_full_batch() {
            match self.flusher.attempt_flush().await {
                FlushOutcome::Persisted { .. } => {}
                FlushOutcome::Skipped | FlushOutcome::Empty | FlushOutcome::Requeued { .. } => {
                    break;
                }
            }
        }
    }
}
