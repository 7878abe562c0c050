use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::{ObjectStore, PutCondition, StorageError};

/// In-process object store with strongly consistent conditional writes.
///
/// Used for single-process deployments and tests. The clock can be frozen and
/// advanced so lease and window expiry are deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    next_version: u64,
    frozen_at: Option<DateTime<Utc>>,
    offset: Duration,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    etag: String,
}

impl MemoryStore {
    /// Creates an empty store that follows the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store whose clock is stopped at `at`.
    #[must_use]
    pub fn frozen(at: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(State {
                frozen_at: Some(at),
                ..State::default()
            }),
        }
    }

    /// Moves the store clock forward.
    pub async fn advance(&self, by: std::time::Duration) {
        let by = Duration::from_std(by).unwrap_or_else(|_| Duration::zero());
        let mut state = self.state.lock().await;
        state.offset += by;
    }

    /// Number of stored objects under `prefix`.
    pub async fn count(&self, prefix: &str) -> usize {
        let state = self.state.lock().await;
        state
            .objects
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn now(&self) -> Result<DateTime<Utc>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.frozen_at.unwrap_or_else(Utc::now) + state.offset)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition,
    ) -> Result<String, StorageError> {
        let mut state = self.state.lock().await;
        let current = state.objects.get(key).map(|o| o.etag.as_str());
        let allowed = match (&condition, current) {
            (PutCondition::None, _) | (PutCondition::IfNoneMatch, None) => true,
            (PutCondition::IfMatch(expected), Some(actual)) => expected == actual,
            (PutCondition::IfNoneMatch, Some(_)) | (PutCondition::IfMatch(_), None) => false,
        };
        if !allowed {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }

        state.next_version += 1;
        let etag = format!("\"{}\"", state.next_version);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get_object(&self, key: &str) -> Result<(Vec<u8>, String), StorageError> {
        let state = self.state.lock().await;
        state
            .objects
            .get(key)
            .map(|o| (o.body.clone(), o.etag.clone()))
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.state.lock().await.objects.remove(key);
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        limit: i32,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), StorageError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        if limit == 0 {
            return Ok((Vec::new(), None));
        }

        let state = self.state.lock().await;
        let start = continuation_token.map_or(Bound::Included(prefix), Bound::Excluded);
        let mut matching = state
            .objects
            .range::<str, _>((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix));

        let keys: Vec<String> = matching.by_ref().take(limit).cloned().collect();
        let next = if matching.next().is_some() {
            keys.last().cloned()
        } else {
            None
        };
        Ok((keys, next))
    }
}
