use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;
use crate::storage::StorageError;

/// Errors returned by [`TaskStore`](super::TaskStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live or succeeded task already holds this idempotency key.
    #[error("Idempotency key '{key}' is already held by task {existing_task_id}")]
    DuplicateIdempotencyKey {
        key: String,
        existing_task_id: Uuid,
    },

    /// The caller no longer owns the task's lease.
    #[error("Lease on task {task_id} is no longer held by '{worker_id}'")]
    LeaseLost { task_id: Uuid, worker_id: String },

    #[error("Task not found: {task_id}")]
    NotFound { task_id: Uuid },

    /// The task is not in a state this operation accepts.
    #[error("Task {task_id} is {found}, expected one of {expected:?}")]
    InvalidStatus {
        task_id: Uuid,
        expected: Vec<TaskStatus>,
        found: TaskStatus,
    },

    /// Conditional writes kept losing; the record is under heavy contention.
    #[error("Gave up updating {key} after repeated concurrent modifications")]
    Contended { key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StoreError {
    /// Returns an operator-facing hint for this error.
    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::DuplicateIdempotencyKey { .. } => {
                "The same logical operation was already submitted. Inspect it with \
                 `crmq status <id>`. A key becomes reusable only after its task is \
                 dead-lettered."
            }
            Self::LeaseLost { .. } => {
                "The worker held the task past its lease and another worker reclaimed it. \
                 Raise queue.lease_duration_secs above the CRM request timeout."
            }
            Self::NotFound { .. } => "Check the task id. Task records are never deleted by crmq.",
            Self::InvalidStatus { .. } => {
                "The task moved on before this operation ran. Re-read it with \
                 `crmq status <id>`."
            }
            Self::Contended { .. } => {
                "Many writers are updating the same record. The operation is safe to retry."
            }
            Self::Storage(err) => err.suggestion(),
        }
    }

    /// Formats the error together with its suggestion for CLI output.
    #[must_use]
    pub fn display_rich(&self) -> String {
        format!("Error: {}\n\nSuggestion:\n  {}", self, self.suggestion())
    }

    #[must_use]
    pub const fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.into())
    }
}
