//! Lease-based checkout.
//!
//! `lease` walks the ordering index (`open/{priority}/{created}/{id}`) from the
//! front and claims each eligible task with an `If-Match` write. Losing the
//! write means another worker took the task; the scan moves on. Expired leases
//! are simply eligible again, so a crashed worker's tasks come back with no
//! external action.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use uuid::Uuid;

use super::store::Change;
use super::transitions::apply_failure;
use super::{StoreError, TaskStore};
use crate::models::{parse_open_index_key, Task, TaskKind, TaskStatus, OPEN_INDEX_PREFIX};
use crate::storage::{after, write_json, PutCondition, StorageError};

/// Restricts which tasks a `lease` call may take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LeaseFilter {
    /// Any kind.
    #[default]
    Any,
    /// Everything except bulk kinds, which are left to the batcher.
    SingleRecord,
    /// Only the listed kinds.
    Kinds(Vec<TaskKind>),
    /// One batch group.
    Group { object_type: String, kind: TaskKind },
}

impl LeaseFilter {
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Any => true,
            Self::SingleRecord => !task.kind.is_bulk(),
            Self::Kinds(kinds) => kinds.contains(&task.kind),
            Self::Group { object_type, kind } => {
                task.kind == *kind && task.object_type == *object_type
            }
        }
    }
}

pub(crate) enum LeaseAttempt {
    Leased(Box<Task>),
    /// Another writer won the conditional write.
    Conflict,
    /// Not eligible right now.
    Skipped,
    /// Index entry points at a missing or finished task.
    Stale,
}

impl TaskStore {
    /// Leases up to `max_items` eligible tasks of any kind.
    ///
    /// See [`lease_matching`](Self::lease_matching).
    pub async fn lease(
        &self,
        worker_id: &str,
        max_items: usize,
        lease_duration: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        self.lease_matching(worker_id, max_items, lease_duration, &LeaseFilter::Any)
            .await
    }

    /// Leases up to `max_items` eligible tasks matching `filter`.
    ///
    /// Eligible: `Pending`/`FailedRetryable` with `available_at <= now`, or
    /// `Leased` with an expired lease. Tasks are taken in
    /// `(priority asc, created_at asc)` order. Each returned task is `Leased`
    /// to `worker_id` until `now + lease_duration`. No two concurrent callers
    /// receive the same task. Returns an empty vector when nothing is eligible.
    pub async fn lease_matching(
        &self,
        worker_id: &str,
        max_items: usize,
        lease_duration: Duration,
        filter: &LeaseFilter,
    ) -> Result<Vec<Task>, StoreError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let now = self.now().await?;
        let expires_at = after(now, lease_duration);

        // Held, backed-off and filtered tasks keep their index entries, so the
        // walk continues page by page until enough are claimed or the index ends.
        let mut leased = Vec::new();
        let mut continuation: Option<String> = None;
        'pages: loop {
            let (keys, next) = self
                .store
                .list_objects(
                    OPEN_INDEX_PREFIX,
                    self.config.scan_limit,
                    continuation.as_deref(),
                )
                .await?;

            for key in keys {
                if leased.len() >= max_items {
                    break 'pages;
                }
                let Some(task_id) = parse_open_index_key(&key) else {
                    continue;
                };

                match self
                    .try_lease(task_id, worker_id, expires_at, now, filter, None)
                    .await?
                {
                    LeaseAttempt::Leased(task) => leased.push(*task),
                    LeaseAttempt::Conflict => {
                        counter!("crmq.lease.conflict").increment(1);
                    }
                    LeaseAttempt::Skipped => {}
                    LeaseAttempt::Stale => self.delete_index_key(&key).await,
                }
            }

            match next {
                Some(token) if leased.len() < max_items => continuation = Some(token),
                _ => break,
            }
        }

        if !leased.is_empty() {
            counter!("crmq.lease.claimed").increment(leased.len() as u64);
            tracing::debug!(worker_id, count = leased.len(), "Leased tasks");
        }
        Ok(leased)
    }

    /// Attempts one conditional claim of `task_id` for `owner`.
    pub(crate) async fn try_lease(
        &self,
        task_id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        filter: &LeaseFilter,
        batch_id: Option<Uuid>,
    ) -> Result<LeaseAttempt, StoreError> {
        let Some((mut task, etag)) = self.get_with_etag(task_id).await? else {
            return Ok(LeaseAttempt::Stale);
        };
        if task.status.is_terminal() {
            return Ok(LeaseAttempt::Stale);
        }
        if task.is_abandoned_at(now) {
            self.recover_abandoned(task_id).await?;
            return Ok(LeaseAttempt::Skipped);
        }
        if !filter.matches(&task) || !task.is_leasable_at(now) {
            return Ok(LeaseAttempt::Skipped);
        }

        let previous_owner = (task.status == TaskStatus::Leased)
            .then(|| task.lease_owner.clone())
            .flatten();

        task.status = TaskStatus::Leased;
        task.lease_owner = Some(owner.to_string());
        task.lease_expires_at = Some(expires_at);
        task.batch_id = batch_id;
        task.last_updated_at = now;

        match write_json(&*self.store, &task.key(), &task, PutCondition::IfMatch(etag)).await {
            Ok(_) => {
                if let Some(previous) = previous_owner {
                    counter!("crmq.lease.reclaimed").increment(1);
                    tracing::info!(
                        task_id = %task.id,
                        previous_owner = %previous,
                        owner,
                        "Reclaimed expired lease"
                    );
                }
                Ok(LeaseAttempt::Leased(Box::new(task)))
            }
            Err(StorageError::PreconditionFailed { .. }) => Ok(LeaseAttempt::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a leased task to `Processing`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LeaseLost` if the lease expired or belongs to someone else.
    pub async fn mark_processing(&self, task_id: Uuid, worker_id: &str) -> Result<Task, StoreError> {
        self.modify(task_id, |task, now| {
            let owned_and_live = task.is_owned_by(worker_id) && task.has_live_lease(now);
            match task.status {
                TaskStatus::Processing if owned_and_live => Ok(Change::Unchanged),
                TaskStatus::Leased if owned_and_live => {
                    task.status = TaskStatus::Processing;
                    Ok(Change::Updated)
                }
                _ => Err(StoreError::LeaseLost {
                    task_id,
                    worker_id: worker_id.to_string(),
                }),
            }
        })
        .await
        .inspect_err(|e| {
            if e.is_lease_lost() {
                counter!("crmq.lease.lost").increment(1);
            }
        })
    }

    /// Hands a leased task back without charging an attempt.
    ///
    /// The task returns to its waiting status and becomes eligible after `delay`.
    /// Used when the call budget or the credential is unavailable.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LeaseLost` if the task is not leased to `worker_id`.
    pub async fn release(
        &self,
        task_id: Uuid,
        worker_id: &str,
        delay: Duration,
    ) -> Result<Task, StoreError> {
        let task = self
            .modify(task_id, |task, now| {
                if task.status != TaskStatus::Leased || !task.is_owned_by(worker_id) {
                    return Err(StoreError::LeaseLost {
                        task_id,
                        worker_id: worker_id.to_string(),
                    });
                }
                task.status = task.waiting_status();
                task.clear_lease();
                task.batch_id = None;
                task.available_at = after(now, delay);
                task.deferrals += 1;
                Ok(Change::Updated)
            })
            .await?;

        counter!("crmq.tasks.deferred").increment(1);
        Ok(task)
    }

    /// Returns an expired `Leased` task to its waiting status.
    ///
    /// Returns `None` when the task no longer needs it.
    pub async fn revert_expired_lease(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut reverted = false;
        let task = self
            .modify(task_id, |task, now| {
                reverted = task.status == TaskStatus::Leased && !task.has_live_lease(now);
                if !reverted {
                    return Ok(Change::Unchanged);
                }
                task.status = task.waiting_status();
                task.clear_lease();
                task.batch_id = None;
                Ok(Change::Updated)
            })
            .await?;
        Ok(reverted.then_some(task))
    }

    /// Charges a retryable failure to a task whose lease ran out mid-call.
    ///
    /// The external call may or may not have happened, so the attempt counts.
    /// Returns `None` when the task is not abandoned.
    pub async fn recover_abandoned(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut recovered = false;
        let task = self
            .modify(task_id, |task, now| {
                recovered = task.is_abandoned_at(now);
                if !recovered {
                    return Ok(Change::Unchanged);
                }
                let owner = task.lease_owner.clone().unwrap_or_default();
                apply_failure(
                    task,
                    now,
                    &format!("lease held by '{owner}' expired while processing"),
                    true,
                );
                Ok(Change::Updated)
            })
            .await?;

        if !recovered {
            return Ok(None);
        }
        counter!("crmq.lease.abandoned").increment(1);
        tracing::warn!(
            task_id = %task.id,
            status = %task.status,
            attempt = task.attempt,
            "Recovered task abandoned mid-call"
        );
        if task.status.is_terminal() {
            self.delete_index(&task).await;
        }
        Ok(Some(task))
    }
}
