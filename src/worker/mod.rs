//! Long-running loops that drive the queue:
//! - `Worker` - leases tasks and executes them one record at a time
//! - `Batcher` - folds bulk tasks into bulk calls
//! - `Sweeper` - reverts expired leases and repairs the ordering index
//! - `PollingStrategy` - idle cadence for the worker loop
//! - `shutdown_signal` / `wait_for_shutdown_signal` - SIGINT/SIGTERM handling

mod batcher;
mod polling;
mod runner;
mod sweeper;

use thiserror::Error;

use crate::admission::AdmissionError;
use crate::auth::AuthError;
use crate::queue::StoreError;

pub use batcher::{Batcher, BatcherConfig, BatcherReport, FlushReason};
pub use polling::PollingStrategy;
pub use runner::{
    default_worker_id, shutdown_signal, wait_for_shutdown_signal, CycleReport, TaskOutcome,
    Worker, WorkerConfig,
};
pub use sweeper::{SweepReport, Sweeper};

/// Errors that stop a cycle. Per-task failures never surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl WorkerError {
    /// True if the loop should stop rather than retry.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_fatal(),
            Self::Store(_) | Self::Admission(_) => false,
        }
    }

    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Store(e) => e.suggestion(),
            Self::Admission(e) => e.suggestion(),
            Self::Auth(e) => e.suggestion(),
        }
    }

    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }
}
