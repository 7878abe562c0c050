//! Object storage backends.
//!
//! Every piece of shared state (tasks, the ordering index, idempotency
//! records, the budget window, the credential) is an object in a key/value
//! store that supports conditional writes. Atomic transitions are
//! read-`ETag`-then-`If-Match` loops; creation races use `If-None-Match`.
//! The store is also the clock: all expiry decisions use [`ObjectStore::now`].

mod error;
mod memory;
mod s3;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use s3::{S3Client, S3Config};

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional write.
    None,
    /// `If-None-Match: *`: create only if the key is absent.
    IfNoneMatch,
    /// `If-Match: "etag"`: replace only if the current `ETag` matches.
    IfMatch(String),
}

/// A key/value object store with compare-and-swap writes.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    /// Authoritative current time for lease, window and token expiry.
    async fn now(&self) -> Result<DateTime<Utc>, StorageError>;

    /// Writes `body` under `key`, honoring `condition`. Returns the new `ETag`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::PreconditionFailed` if the condition is not met.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition,
    ) -> Result<String, StorageError>;

    /// Reads an object and its `ETag`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the key is absent.
    async fn get_object(&self, key: &str) -> Result<(Vec<u8>, String), StorageError>;

    /// Deletes an object. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Lists keys under `prefix` in lexicographic order, one page at a time.
    async fn list_objects(
        &self,
        prefix: &str,
        limit: i32,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), StorageError>;

    /// Lists up to `limit` keys under `prefix`, following pagination.
    #[allow(clippy::cast_sign_loss)]
    async fn list_objects_paginated(
        &self,
        prefix: &str,
        limit: i32,
    ) -> Result<Vec<String>, StorageError> {
        const MAX_KEYS_PER_PAGE: usize = 1000;

        if limit <= 0 {
            return Ok(Vec::new());
        }

        let limit = limit as usize;
        let mut keys: Vec<String> = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let remaining = limit.saturating_sub(keys.len());
            if remaining == 0 {
                break;
            }

            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let page_limit = remaining.min(MAX_KEYS_PER_PAGE) as i32;
            let (mut page, next) = self
                .list_objects(prefix, page_limit, continuation_token.as_deref())
                .await?;
            keys.append(&mut page);

            match next {
                Some(token) if keys.len() < limit => continuation_token = Some(token),
                _ => break,
            }
        }

        keys.truncate(limit);
        Ok(keys)
    }
}

/// Shared handle to a backend.
pub type SharedStore = Arc<dyn ObjectStore>;

/// Reads and decodes a JSON record. Returns `None` if the key is absent.
///
/// # Errors
///
/// Returns a storage error for backend failures or undecodable bodies.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<(T, String)>, StorageError> {
    match store.get_object(key).await {
        Ok((body, etag)) => {
            let value = serde_json::from_slice(&body)?;
            Ok(Some((value, etag)))
        }
        Err(StorageError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Encodes and writes a JSON record with the given condition.
///
/// # Errors
///
/// Returns `StorageError::PreconditionFailed` when the CAS loses.
pub async fn write_json<T: Serialize + Sync>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
    condition: PutCondition,
) -> Result<String, StorageError> {
    let body = serde_json::to_vec(value)?;
    store.put_object(key, body, condition).await
}

/// `now + delay`, saturating at the latest representable time.
#[must_use]
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
