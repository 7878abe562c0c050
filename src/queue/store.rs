use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use metrics::counter;
use uuid::Uuid;

use super::idempotency::derive_idempotency_key;
use super::{StoreConfig, StoreError};
use crate::models::{task_key, NewTask, QueueStats, Task, TaskStatus};
use crate::storage::{read_json, write_json, PutCondition, SharedStore, StorageError};

/// Result of a transition closure passed to [`TaskStore::modify`].
pub(crate) enum Change {
    /// Write the modified task back.
    Updated,
    /// Leave the stored task untouched.
    Unchanged,
}

/// Durable task store with lease-based checkout.
///
/// Every state change is a read-modify-write guarded by `If-Match`, so two
/// workers can never both win a transition on the same task.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pub(crate) store: SharedStore,
    pub(crate) config: StoreConfig,
}

impl TaskStore {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self::with_config(store, StoreConfig::default())
    }

    #[must_use]
    pub const fn with_config(store: SharedStore, config: StoreConfig) -> Self {
        Self { store, config }
    }

    /// The underlying object store.
    #[must_use]
    pub fn object_store(&self) -> &SharedStore {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current time according to the object store.
    pub async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.store.now().await?)
    }

    /// Fetches a task by id.
    pub async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.get_with_etag(task_id).await?.map(|(task, _)| task))
    }

    pub(crate) async fn get_with_etag(
        &self,
        task_id: Uuid,
    ) -> Result<Option<(Task, String)>, StoreError> {
        Ok(read_json(&*self.store, &task_key(task_id)).await?)
    }

    /// Inserts a new task as `Pending` with `attempt = 0`.
    ///
    /// The idempotency key is reserved first, then the task record is written,
    /// then its ordering-index entry (best-effort; the sweeper repairs gaps).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateIdempotencyKey` if a task that is not
    /// dead-lettered already holds the key.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let now = self.now().await?;
        let idempotency_key = new_task.idempotency_key.clone().unwrap_or_else(|| {
            derive_idempotency_key(&new_task.object_type, new_task.kind, &new_task.payload)
        });

        let task = Task {
            id: Uuid::now_v7(),
            kind: new_task.kind,
            object_type: new_task.object_type,
            payload: new_task.payload,
            idempotency_key,
            priority: new_task.priority,
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: new_task
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            retry_policy: new_task
                .retry_policy
                .unwrap_or_else(|| self.config.default_retry_policy.clone()),
            lease_owner: None,
            lease_expires_at: None,
            batch_id: None,
            available_at: new_task.available_at.unwrap_or(now),
            created_at: now,
            last_updated_at: now,
            completed_at: None,
            completed_by: None,
            result: None,
            error: None,
            deferrals: 0,
        };

        self.reserve_idempotency_key(&task, now).await?;
        write_json(&*self.store, &task.key(), &task, PutCondition::IfNoneMatch).await?;
        self.create_index(&task).await;

        counter!("crmq.tasks.enqueued").increment(1);
        tracing::debug!(
            task_id = %task.id,
            kind = %task.kind,
            object_type = %task.object_type,
            priority = task.priority,
            "Enqueued task"
        );
        Ok(task)
    }

    /// Reads every task record.
    pub async fn scan_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let keys = self.store.list_objects_paginated("tasks/", i32::MAX).await?;
        let store = &*self.store;
        let tasks: Vec<Option<(Task, String)>> = futures::stream::iter(keys)
            .map(|key| async move { read_json::<Task>(store, &key).await })
            .buffer_unordered(self.config.read_concurrency.max(1))
            .try_collect()
            .await?;
        Ok(tasks.into_iter().flatten().map(|(task, _)| task).collect())
    }

    /// Task counts by effective status.
    ///
    /// Dead-lettered tasks are reported separately from failed-retryable ones.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let now = self.now().await?;
        let mut stats = QueueStats::default();
        for task in self.scan_tasks().await? {
            stats.record(task.effective_status(now));
        }
        Ok(stats)
    }

    /// Applies `apply` to the stored task under `If-Match`, re-reading on conflict.
    ///
    /// `apply` sees the freshest copy and the store time; returning an error
    /// aborts without writing.
    pub(crate) async fn modify<F>(&self, task_id: Uuid, mut apply: F) -> Result<Task, StoreError>
    where
        F: FnMut(&mut Task, DateTime<Utc>) -> Result<Change, StoreError> + Send,
    {
        for _ in 0..=self.config.cas_retries {
            let (mut task, etag) = self
                .get_with_etag(task_id)
                .await?
                .ok_or(StoreError::NotFound { task_id })?;
            let now = self.now().await?;

            if matches!(apply(&mut task, now)?, Change::Unchanged) {
                return Ok(task);
            }
            task.last_updated_at = now;

            match write_json(&*self.store, &task.key(), &task, PutCondition::IfMatch(etag)).await {
                Ok(_) => return Ok(task),
                Err(StorageError::PreconditionFailed { .. }) => {
                    counter!("crmq.store.cas_conflict").increment(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contended {
            key: task_key(task_id),
        })
    }

    pub(crate) async fn create_index(&self, task: &Task) {
        let key = task.open_index_key();
        if let Err(e) = self
            .store
            .put_object(&key, Vec::new(), PutCondition::None)
            .await
        {
            tracing::warn!(key = %key, error = %e, "Failed to create ordering index entry");
        }
    }

    pub(crate) async fn delete_index(&self, task: &Task) {
        self.delete_index_key(&task.open_index_key()).await;
    }

    pub(crate) async fn delete_index_key(&self, key: &str) {
        if let Err(e) = self.store.delete_object(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete ordering index entry");
        }
    }
}
