//! Terminal and retry transitions for leased tasks.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use uuid::Uuid;

use super::store::Change;
use super::{StoreError, TaskStore};
use crate::models::{Task, TaskStatus};
use crate::storage::after;

impl TaskStore {
    /// Marks a processing task `Succeeded` and stores its result.
    ///
    /// Calling again from the same worker after success is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LeaseLost` if `worker_id` no longer holds the task.
    pub async fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<Task, StoreError> {
        let mut changed = false;
        let task = self
            .modify(task_id, |task, now| {
                if task.status == TaskStatus::Succeeded
                    && task.completed_by.as_deref() == Some(worker_id)
                {
                    changed = false;
                    return Ok(Change::Unchanged);
                }
                if task.status != TaskStatus::Processing || !task.is_owned_by(worker_id) {
                    return Err(StoreError::LeaseLost {
                        task_id,
                        worker_id: worker_id.to_string(),
                    });
                }
                task.status = TaskStatus::Succeeded;
                task.result = Some(result.clone());
                task.error = None;
                task.completed_at = Some(now);
                task.completed_by = Some(worker_id.to_string());
                task.clear_lease();
                changed = true;
                Ok(Change::Updated)
            })
            .await?;

        if changed {
            self.delete_index(&task).await;
            counter!("crmq.tasks.succeeded").increment(1);
            tracing::debug!(task_id = %task.id, worker_id, "Task succeeded");
        }
        Ok(task)
    }

    /// Records a failed execution.
    ///
    /// A retryable failure with attempts left increments `attempt` and makes the
    /// task available again after its backoff. A retryable failure on the last
    /// attempt, or any permanent failure, dead-letters it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LeaseLost` if `worker_id` no longer holds the task.
    pub async fn fail(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Task, StoreError> {
        let task = self
            .modify(task_id, |task, now| {
                let held = matches!(task.status, TaskStatus::Leased | TaskStatus::Processing)
                    && task.is_owned_by(worker_id);
                if !held {
                    return Err(StoreError::LeaseLost {
                        task_id,
                        worker_id: worker_id.to_string(),
                    });
                }
                apply_failure(task, now, error, retryable);
                Ok(Change::Updated)
            })
            .await?;

        self.after_failure(&task, retryable).await;
        Ok(task)
    }

    pub(crate) async fn after_failure(&self, task: &Task, retryable: bool) {
        match task.status {
            TaskStatus::DeadLettered => {
                self.delete_index(task).await;
                counter!("crmq.tasks.dead_lettered").increment(1);
                tracing::warn!(
                    task_id = %task.id,
                    attempt = task.attempt,
                    retryable,
                    error = task.error.as_deref().unwrap_or_default(),
                    "Task dead-lettered"
                );
            }
            _ => {
                counter!("crmq.tasks.retried").increment(1);
                tracing::info!(
                    task_id = %task.id,
                    attempt = task.attempt,
                    max_attempts = task.max_attempts,
                    available_at = %task.available_at,
                    "Task scheduled for retry"
                );
            }
        }
    }
}

/// Applies a failure outcome to `task` in place and clears its lease.
pub(crate) fn apply_failure(task: &mut Task, now: DateTime<Utc>, error: &str, retryable: bool) {
    if retryable && task.attempt < task.max_attempts {
        let delay = task.retry_policy.backoff(task.attempt);
        task.attempt += 1;
        task.status = TaskStatus::FailedRetryable;
        task.available_at = after(now, delay);
    } else {
        task.status = TaskStatus::DeadLettered;
        task.completed_at = Some(now);
    }
    task.error = Some(error.to_string());
    task.batch_id = None;
    task.clear_lease();
}
