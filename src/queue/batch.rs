//! Batch jobs over bulk-eligible tasks.
//!
//! A batch is claimed by leasing each member to the owner `batch:{id}` and
//! writing a `batches/{id}.json` record that fixes member order. The bulk
//! response is demultiplexed by position so each member gets its own
//! `complete` or `fail`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use serde_json::Value;
use uuid::Uuid;

use super::lease::{LeaseAttempt, LeaseFilter};
use super::{StoreError, TaskStore};
use crate::models::{
    batch_key, parse_open_index_key, BatchJob, BatchStatus, RecordOutcome, Task, TaskKind,
    TaskStatus, OPEN_INDEX_PREFIX,
};
use crate::storage::{after, read_json, write_json, PutCondition, StorageError};

/// Eligible bulk tasks sharing an object type and operation kind.
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub object_type: String,
    pub kind: TaskKind,
    /// Members in lease order.
    pub tasks: Vec<Task>,
}

impl BatchGroup {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// When the longest-waiting member became eligible.
    #[must_use]
    pub fn oldest_waiting_since(&self) -> Option<DateTime<Utc>> {
        self.tasks.iter().map(Task::waiting_since).min()
    }

    /// Earliest eligibility among members with `priority <= threshold`.
    #[must_use]
    pub fn urgent_waiting_since(&self, threshold: u16) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter(|task| task.priority <= threshold)
            .map(Task::waiting_since)
            .min()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.tasks.iter().map(|task| task.id).collect()
    }
}

/// A claimed batch and its members in submission order.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub job: BatchJob,
    pub tasks: Vec<Task>,
}

impl ClaimedBatch {
    /// Record payloads for the bulk call, aligned with `tasks`.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.tasks.iter().map(|task| task.payload.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Per-member tally after a batch is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Members whose transition was rejected because the batch lost them.
    pub lost: usize,
}

impl BatchReport {
    fn record(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::DeadLettered => self.dead_lettered += 1,
            _ => self.retried += 1,
        }
    }
}

impl TaskStore {
    /// Groups currently eligible bulk tasks by `(object_type, kind)`.
    ///
    /// Groups appear in the order their first member sits in the ordering
    /// index. The index is walked page by page, skipping past held and
    /// single-record entries, until `scan_limit` eligible bulk tasks are
    /// gathered or the index ends.
    pub async fn batch_candidates(&self) -> Result<Vec<BatchGroup>, StoreError> {
        let now = self.now().await?;
        let wanted = usize::try_from(self.config.scan_limit).unwrap_or(0);

        let mut eligible: Vec<Task> = Vec::new();
        let mut continuation: Option<String> = None;
        while eligible.len() < wanted {
            let (keys, next) = self
                .store
                .list_objects(
                    OPEN_INDEX_PREFIX,
                    self.config.scan_limit,
                    continuation.as_deref(),
                )
                .await?;
            let ids: Vec<Uuid> = keys.iter().filter_map(|k| parse_open_index_key(k)).collect();

            let page: Vec<Option<Task>> = futures::stream::iter(ids)
                .map(|id| self.get(id))
                .buffered(self.config.read_concurrency.max(1))
                .try_collect()
                .await?;
            eligible.extend(
                page.into_iter()
                    .flatten()
                    .filter(|task| task.kind.is_bulk() && task.is_leasable_at(now)),
            );

            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        eligible.truncate(wanted);

        let mut groups: Vec<BatchGroup> = Vec::new();
        let mut positions: HashMap<(String, TaskKind), usize> = HashMap::new();
        for task in eligible {
            let slot = (task.object_type.clone(), task.kind);
            let idx = *positions.entry(slot).or_insert_with(|| {
                groups.push(BatchGroup {
                    object_type: task.object_type.clone(),
                    kind: task.kind,
                    tasks: Vec::new(),
                });
                groups.len() - 1
            });
            groups[idx].tasks.push(task);
        }
        Ok(groups)
    }

    /// Claims `candidates` as one batch job.
    ///
    /// Members that another worker took in the meantime are left out. Returns
    /// `None` if no member could be claimed.
    pub async fn claim_batch(
        &self,
        object_type: &str,
        kind: TaskKind,
        candidates: &[Uuid],
        lease_duration: Duration,
    ) -> Result<Option<ClaimedBatch>, StoreError> {
        let now = self.now().await?;
        let expires_at = after(now, lease_duration);
        let filter = LeaseFilter::Group {
            object_type: object_type.to_string(),
            kind,
        };
        let mut job = BatchJob {
            id: Uuid::now_v7(),
            object_type: object_type.to_string(),
            kind,
            members: Vec::new(),
            status: BatchStatus::Claimed,
            lease_expires_at: expires_at,
            created_at: now,
            last_updated_at: now,
        };
        let owner = job.owner();

        let mut tasks = Vec::with_capacity(candidates.len());
        for &task_id in candidates {
            match self
                .try_lease(task_id, &owner, expires_at, now, &filter, Some(job.id))
                .await?
            {
                LeaseAttempt::Leased(task) => tasks.push(*task),
                LeaseAttempt::Conflict => counter!("crmq.lease.conflict").increment(1),
                LeaseAttempt::Skipped | LeaseAttempt::Stale => {}
            }
        }
        if tasks.is_empty() {
            return Ok(None);
        }

        job.members = tasks.iter().map(|task| task.id).collect();
        write_json(&*self.store, &job.key(), &job, PutCondition::IfNoneMatch).await?;
        counter!("crmq.lease.claimed").increment(tasks.len() as u64);
        tracing::debug!(
            batch_id = %job.id,
            object_type,
            kind = %kind,
            members = tasks.len(),
            "Claimed batch"
        );
        Ok(Some(ClaimedBatch { job, tasks }))
    }

    /// Moves every member to `Processing` ahead of the bulk call.
    ///
    /// Members whose lease was lost are dropped from the returned batch so the
    /// response is only applied to tasks still held.
    pub async fn start_batch(&self, batch: ClaimedBatch) -> Result<ClaimedBatch, StoreError> {
        let owner = batch.job.owner();
        let mut held = Vec::with_capacity(batch.tasks.len());
        for task in batch.tasks {
            match self.mark_processing(task.id, &owner).await {
                Ok(task) => held.push(task),
                Err(e) if e.is_lease_lost() => {
                    tracing::warn!(task_id = %task.id, batch_id = %batch.job.id, "Batch member lease lost before submit");
                }
                Err(e) => return Err(e),
            }
        }

        let mut job = batch.job;
        job.members = held.iter().map(|task| task.id).collect();
        job.status = BatchStatus::Submitted;
        self.save_batch(&mut job).await?;
        Ok(ClaimedBatch { job, tasks: held })
    }

    /// Applies per-record outcomes to the members, by position.
    ///
    /// A member with no corresponding outcome is failed as retryable.
    pub async fn resolve_batch(
        &self,
        batch: &ClaimedBatch,
        outcomes: Vec<RecordOutcome>,
    ) -> Result<BatchReport, StoreError> {
        let owner = batch.job.owner();
        if outcomes.len() != batch.tasks.len() {
            tracing::warn!(
                batch_id = %batch.job.id,
                members = batch.tasks.len(),
                outcomes = outcomes.len(),
                "Bulk response size does not match batch"
            );
        }

        let mut report = BatchReport::default();
        let mut outcomes = outcomes.into_iter();
        for task in &batch.tasks {
            let applied = match outcomes.next() {
                Some(RecordOutcome::Succeeded { result }) => {
                    self.complete(task.id, &owner, result).await
                }
                Some(RecordOutcome::Failed { message, category }) => {
                    self.fail(task.id, &owner, &message, category.is_retryable())
                        .await
                }
                None => {
                    self.fail(task.id, &owner, "no result returned for record", true)
                        .await
                }
            };
            match applied {
                Ok(task) => report.record(&task),
                Err(e) => {
                    report.lost += 1;
                    tracing::warn!(task_id = %task.id, batch_id = %batch.job.id, error = %e, "Could not apply bulk outcome");
                }
            }
        }

        self.finish_batch(&batch.job, BatchStatus::Completed).await;
        Ok(report)
    }

    /// Fails every member with the same error, used when the bulk call as a whole failed.
    pub async fn fail_batch(
        &self,
        batch: &ClaimedBatch,
        error: &str,
        retryable: bool,
    ) -> Result<BatchReport, StoreError> {
        let owner = batch.job.owner();
        let mut report = BatchReport::default();
        for task in &batch.tasks {
            match self.fail(task.id, &owner, error, retryable).await {
                Ok(task) => report.record(&task),
                Err(e) => {
                    report.lost += 1;
                    tracing::warn!(task_id = %task.id, batch_id = %batch.job.id, error = %e, "Could not fail batch member");
                }
            }
        }
        self.finish_batch(&batch.job, BatchStatus::Completed).await;
        Ok(report)
    }

    /// Hands every member back without charging an attempt.
    ///
    /// Returns the number of members released.
    pub async fn release_batch(
        &self,
        batch: &ClaimedBatch,
        delay: Duration,
    ) -> Result<usize, StoreError> {
        let owner = batch.job.owner();
        let mut released = 0;
        for task in &batch.tasks {
            match self.release(task.id, &owner, delay).await {
                Ok(_) => released += 1,
                Err(e) if e.is_lease_lost() => {}
                Err(e) => return Err(e),
            }
        }
        self.finish_batch(&batch.job, BatchStatus::Released).await;
        Ok(released)
    }

    /// Fetches a batch job record.
    pub async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchJob>, StoreError> {
        Ok(read_json(&*self.store, &batch_key(batch_id))
            .await?
            .map(|(job, _)| job))
    }

    /// Marks open batches whose lease has run out as abandoned.
    ///
    /// Their members come back through ordinary lease expiry; only the job
    /// record needs closing. Returns the number of batches closed.
    pub(crate) async fn abandon_expired_batches(&self) -> Result<usize, StoreError> {
        let now = self.now().await?;
        let keys = self.store.list_objects_paginated("batches/", i32::MAX).await?;
        let mut closed = 0;
        for key in keys {
            let Some((mut job, etag)) = read_json::<BatchJob>(&*self.store, &key).await? else {
                continue;
            };
            if !job.status.is_open() || job.lease_expires_at > now {
                continue;
            }
            job.status = BatchStatus::Abandoned;
            job.last_updated_at = now;
            match write_json(&*self.store, &key, &job, PutCondition::IfMatch(etag)).await {
                Ok(_) => {
                    closed += 1;
                    tracing::warn!(batch_id = %job.id, members = job.len(), "Abandoned expired batch");
                }
                Err(StorageError::PreconditionFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(closed)
    }

    async fn save_batch(&self, job: &mut BatchJob) -> Result<(), StoreError> {
        job.last_updated_at = self.now().await?;
        write_json(&*self.store, &job.key(), job, PutCondition::None).await?;
        Ok(())
    }

    async fn finish_batch(&self, job: &BatchJob, status: BatchStatus) {
        let mut job = job.clone();
        job.status = status;
        if let Err(e) = self.save_batch(&mut job).await {
            tracing::warn!(batch_id = %job.id, error = %e, "Failed to update batch record");
        }
        counter!("crmq.batch.closed", "status" => format!("{status:?}").to_lowercase())
            .increment(1);
    }
}
