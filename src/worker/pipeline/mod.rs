//! Event-to-store pipeline: normalization, buffering and flushing.

pub mod buffer;
pub mod event_loop;
pub mod flusher;
pub mod monitor;
pub mod normalizer;
pub mod scheduler;
pub mod stats;

pub use buffer::{Batch, BatchBuffer, RequeueReport};
pub use event_loop::{Disposition, EventLoop, LoopExit};
pub use flusher::{FlushOutcome, Flusher};
pub use monitor::BufferMonitor;
pub use normalizer::{Rejection, normalize_event, normalize_event_at};
pub use scheduler::{FlushScheduler, FlushTrigger};
pub use stats::{IngestStats, StatsSnapshot};
