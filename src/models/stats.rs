use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Task counts by effective status.
///
/// A `Leased` task whose lease has expired is counted as waiting, since
/// any worker may take it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed_retryable: u64,
    pub dead_lettered: u64,
}

impl QueueStats {
    /// Adds one task in `status`.
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Leased => self.leased += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::FailedRetryable => self.failed_retryable += 1,
            TaskStatus::DeadLettered => self.dead_lettered += 1,
        }
    }

    /// Count for a single status.
    #[must_use]
    pub const fn count(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Leased => self.leased,
            TaskStatus::Processing => self.processing,
            TaskStatus::Succeeded => self.succeeded,
            TaskStatus::FailedRetryable => self.failed_retryable,
            TaskStatus::DeadLettered => self.dead_lettered,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending
            + self.leased
            + self.processing
            + self.succeeded
            + self.failed_retryable
            + self.dead_lettered
    }

    /// Work that will run without operator action.
    #[must_use]
    pub const fn backlog(&self) -> u64 {
        self.pending + self.failed_retryable
    }

    /// Work currently held by a worker or batch.
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.leased + self.processing
    }
}
