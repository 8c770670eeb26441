//! Periodic backlog check on the batch buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::worker::core::config::MonitorConfig;
use crate::worker::pipeline::buffer::BatchBuffer;

/// Background task warning when the buffer grows past a threshold.
pub struct BufferMonitor {
    buffer: Arc<BatchBuffer>,
    interval: Duration,
    warn_threshold: usize,
    shutdown: Arc<Notify>,
}

impl BufferMonitor {
    /// Create a monitor for `buffer`.
    #[must_use]
    pub fn new(buffer: Arc<BatchBuffer>, config: &MonitorConfig) -> Self {
        Self {
            buffer,
            interval: config.interval(),
            warn_threshold: config.warn_threshold,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a shutdown notifier to stop the monitor.
    #[must_use]
    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawn the monitor as a tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Check the backlog once; returns `true` when over the threshold.
    pub fn check(&self) -> bool {
        let buffered = self.buffer.len();
        if buffered > self.warn_threshold {
            warn!(
                buffered,
                threshold = self.warn_threshold,
                dead_lettered = self.buffer.dead_lettered(),
                overflow_dropped = self.buffer.overflow_dropped(),
                "Buffer backlog above threshold, sink may be failing"
            );
            true
        } else {
            debug!(buffered, "Buffer backlog check");
            false
        }
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    info!("Buffer monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }
    }
}
