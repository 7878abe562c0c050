//! Idempotency records.
//!
//! `idempotency/{sha256(key)}.json` maps a key to the task holding it. The
//! record is created with `If-None-Match`, so exactly one enqueue wins a key.
//! A key is handed to a new task only when the holder is dead-lettered, or
//! when the holder never got written and the record is older than the
//! orphan grace period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{StoreError, TaskStore};
use crate::models::{Task, TaskKind, TaskStatus};
use crate::storage::{read_json, write_json, PutCondition, StorageError};

/// Maps an idempotency key to the task that currently holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Storage key of the record for `key`.
#[must_use]
pub fn idempotency_record_key(key: &str) -> String {
    format!("idempotency/{}.json", sha256_hex(key.as_bytes()))
}

/// Content-derived key: `{object_type}:{kind}:{sha256(canonical payload)}`.
///
/// Payloads that differ only in object key order derive the same key.
#[must_use]
pub fn derive_idempotency_key(object_type: &str, kind: TaskKind, payload: &Value) -> String {
    let canonical = serde_json::to_string(&canonicalize(payload)).unwrap_or_default();
    format!(
        "{object_type}:{}:{}",
        kind.as_str(),
        sha256_hex(canonical.as_bytes())
    )
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl TaskStore {
    /// Claims `task.idempotency_key` for `task`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateIdempotencyKey` if another live task holds the key.
    pub(crate) async fn reserve_idempotency_key(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record_key = idempotency_record_key(&task.idempotency_key);
        let record = IdempotencyRecord {
            key: task.idempotency_key.clone(),
            task_id: task.id,
            created_at: now,
        };

        for _ in 0..=self.config.cas_retries {
            match write_json(&*self.store, &record_key, &record, PutCondition::IfNoneMatch).await {
                Ok(_) => return Ok(()),
                Err(StorageError::PreconditionFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let Some((existing, etag)) =
                read_json::<IdempotencyRecord>(&*self.store, &record_key).await?
            else {
                continue;
            };

            if !self.is_key_reusable(&existing, now).await? {
                return Err(StoreError::DuplicateIdempotencyKey {
                    key: task.idempotency_key.clone(),
                    existing_task_id: existing.task_id,
                });
            }

            match write_json(&*self.store, &record_key, &record, PutCondition::IfMatch(etag)).await
            {
                Ok(_) => {
                    tracing::debug!(
                        key = %task.idempotency_key,
                        previous_task_id = %existing.task_id,
                        task_id = %task.id,
                        "Reassigned idempotency key"
                    );
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Contended { key: record_key })
    }

    async fn is_key_reusable(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self.get(record.task_id).await? {
            Some(holder) => Ok(holder.status == TaskStatus::DeadLettered),
            None => {
                let grace = chrono::Duration::from_std(self.config.orphan_grace)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                Ok(now - record.created_at >= grace)
            }
        }
    }
}
