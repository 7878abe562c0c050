use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::task::{TaskKind, BATCH_OWNER_PREFIX};
use crate::crm::ErrorCategory;

/// Lifecycle of a batch job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Members are leased to the batch; nothing has been sent.
    Claimed,
    /// Members are processing; the bulk call is in flight.
    Submitted,
    /// Per-record outcomes were applied to every member.
    Completed,
    /// Members were handed back without executing.
    Released,
    /// The batch holder disappeared; members recovered through lease expiry.
    Abandoned,
}

impl BatchStatus {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Claimed | Self::Submitted)
    }
}

/// A group of compatible tasks submitted as one bulk call.
///
/// `members` is ordered; position `i` of the bulk response belongs to `members[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub object_type: String,
    pub kind: TaskKind,
    pub members: Vec<Uuid>,
    pub status: BatchStatus,
    pub lease_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl BatchJob {
    /// Storage key of the batch record.
    #[must_use]
    pub fn key(&self) -> String {
        batch_key(self.id)
    }

    /// Lease owner string carried by member tasks.
    #[must_use]
    pub fn owner(&self) -> String {
        batch_owner(self.id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Storage key of the batch record with `id`.
#[must_use]
pub fn batch_key(id: Uuid) -> String {
    format!("batches/{id}.json")
}

/// Lease owner used for members of batch `id`.
#[must_use]
pub fn batch_owner(id: Uuid) -> String {
    format!("{BATCH_OWNER_PREFIX}{id}")
}

/// Outcome of one record inside a bulk call, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// The record was accepted; `result` is stored on the task.
    Succeeded {
        result: Value,
    },
    /// The record was rejected; `category` decides whether it is retried.
    Failed {
        message: String,
        category: ErrorCategory,
    },
}

impl RecordOutcome {
    #[must_use]
    pub fn failed(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            category,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Succeeded { .. } => false,
            Self::Failed { category, .. } => category.is_retryable(),
        }
    }
}
