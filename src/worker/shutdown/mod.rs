//! Termination handling for the ingestion worker.

pub mod coordinator;

pub use coordinator::{
    ShutdownCoordinator, ShutdownReport, ShutdownState, Workers, wait_for_signal,
};
