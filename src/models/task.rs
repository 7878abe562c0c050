use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::retry::RetryPolicy;

/// Prefix of the ordering index of non-terminal tasks.
pub const OPEN_INDEX_PREFIX: &str = "open/";

/// Owner prefix used while a task is held by a batch job.
pub const BATCH_OWNER_PREFIX: &str = "batch:";

/// Operation a task performs against the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Create one record.
    Create,
    /// Run a query.
    Query,
    /// Update one record.
    Update,
    /// Delete one record.
    Delete,
    /// One record of a bulk create; coalesced by the batcher.
    BulkCreate,
    /// One record of a bulk update; coalesced by the batcher.
    BulkUpdate,
}

impl TaskKind {
    /// All kinds.
    pub const ALL: &'static [Self] = &[
        Self::Create,
        Self::Query,
        Self::Update,
        Self::Delete,
        Self::BulkCreate,
        Self::BulkUpdate,
    ];

    /// True for kinds the batcher folds into bulk jobs.
    #[must_use]
    pub const fn is_bulk(self) -> bool {
        matches!(self, Self::BulkCreate | Self::BulkUpdate)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Query => "query",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkCreate => "bulk_create",
            Self::BulkUpdate => "bulk_update",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "create" => Ok(Self::Create),
            "query" | "read" => Ok(Self::Query),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "bulk_create" => Ok(Self::BulkCreate),
            "bulk_update" => Ok(Self::BulkUpdate),
            other => Err(format!(
                "unknown task kind '{other}' (use create, query, update, delete, bulk-create or bulk-update)"
            )),
        }
    }
}

/// Lifecycle state of a task.
///
/// `Pending -> Leased -> Processing -> {Succeeded | FailedRetryable | DeadLettered}`.
/// `FailedRetryable` is leasable again once its backoff has elapsed.
/// `Succeeded` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be leased.
    Pending,
    /// Exclusively held by one worker until `lease_expires_at`.
    Leased,
    /// The external call is in flight.
    Processing,
    /// Finished successfully.
    Succeeded,
    /// Failed transiently; waiting out its backoff.
    FailedRetryable,
    /// Failed permanently or exhausted its attempts.
    DeadLettered,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Leased,
        Self::Processing,
        Self::Succeeded,
        Self::FailedRetryable,
        Self::DeadLettered,
    ];

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s.replace('-', "_"))
            .ok_or(())
    }
}

/// A unit of work against the CRM.
///
/// Stored as `tasks/{id}.json` and mutated only through `If-Match` writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Time-ordered id (UUIDv7), assigned at enqueue.
    pub id: Uuid,
    pub kind: TaskKind,
    /// CRM record type, e.g. `Account`.
    pub object_type: String,
    /// Record fields, record id, or query text depending on `kind`.
    pub payload: Value,
    pub idempotency_key: String,
    /// Lower runs first.
    pub priority: u16,
    pub status: TaskStatus,
    /// Retryable failures recorded so far. Never exceeds `max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Batch job currently or last holding this task.
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    /// Earliest time the task may be leased.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that reported success, for idempotent `complete`.
    #[serde(default)]
    pub completed_by: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Times the task was handed back without executing (budget or credential waits).
    #[serde(default)]
    pub deferrals: u32,
}

impl Task {
    /// Storage key of the task record.
    #[must_use]
    pub fn key(&self) -> String {
        task_key(self.id)
    }

    /// Key of this task's entry in the ordering index.
    ///
    /// Lexicographic order of these keys is `(priority, created_at, id)`.
    #[must_use]
    pub fn open_index_key(&self) -> String {
        let micros = self.created_at.timestamp_micros().max(0);
        format!(
            "{OPEN_INDEX_PREFIX}{:05}/{micros:020}/{}",
            self.priority, self.id
        )
    }

    /// True while a lease exists and has not expired at `now`.
    #[must_use]
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// True if the lease is held by `worker_id`, expired or not.
    #[must_use]
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(worker_id)
    }

    /// True if `lease` may hand this task out at `now`.
    #[must_use]
    pub fn is_leasable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::FailedRetryable => self.available_at <= now,
            TaskStatus::Leased => !self.has_live_lease(now),
            TaskStatus::Processing | TaskStatus::Succeeded | TaskStatus::DeadLettered => false,
        }
    }

    /// True if the task was mid-call when its lease ran out.
    #[must_use]
    pub fn is_abandoned_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing && !self.has_live_lease(now)
    }

    /// Status as observers should see it: an expired lease reads as waiting.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> TaskStatus {
        if self.status == TaskStatus::Leased && !self.has_live_lease(now) {
            self.waiting_status()
        } else {
            self.status
        }
    }

    /// The waiting status this task returns to when handed back without a charge.
    #[must_use]
    pub const fn waiting_status(&self) -> TaskStatus {
        if self.attempt > 0 {
            TaskStatus::FailedRetryable
        } else {
            TaskStatus::Pending
        }
    }

    /// Time this task has been eligible, measured from `available_at` or creation.
    #[must_use]
    pub fn waiting_since(&self) -> DateTime<Utc> {
        self.available_at.max(self.created_at)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Storage key of the task record with `id`.
#[must_use]
pub fn task_key(id: Uuid) -> String {
    format!("tasks/{id}.json")
}

/// Extracts the task id from an ordering-index key.
#[must_use]
pub fn parse_open_index_key(key: &str) -> Option<Uuid> {
    let rest = key.strip_prefix(OPEN_INDEX_PREFIX)?;
    let mut parts = rest.split('/');
    let (_priority, _created, id) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Uuid::parse_str(id).ok()
}

/// A task as submitted by a producer, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub object_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub priority: u16,
    pub max_attempts: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
    pub available_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Starts a submission with default priority 5.
    #[must_use]
    pub fn new(kind: TaskKind, object_type: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            object_type: object_type.into(),
            payload,
            idempotency_key: None,
            priority: 5,
            max_attempts: None,
            retry_policy: None,
            available_at: None,
        }
    }

    /// Caller-supplied idempotency key. Derived from the content when unset.
    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Delays first eligibility.
    #[must_use]
    pub const fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}
