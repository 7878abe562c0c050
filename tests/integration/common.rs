//! Common test utilities.
//!
//! Most tests run against a frozen [`MemoryStore`] so lease and window expiry
//! are driven by `advance`. The `s3_backend` tests read their endpoint from
//! the environment:
//!
//! ```bash
//! S3_ENDPOINT=http://localhost:4566 S3_BUCKET=crmq-dev \
//!     cargo test --test integration --features integration
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crmq::admission::{AdmissionConfig, AdmissionController};
use crmq::auth::{AccessToken, AuthError, CredentialCache, CredentialConfig, TokenGrant, TokenProvider};
use crmq::crm::{CrmClient, CrmOperation, ErrorCategory, ExecutionError};
use crmq::models::{NewTask, RecordOutcome, RetryPolicy, Task, TaskKind};
use crmq::queue::{StoreConfig, TaskStore};
use crmq::storage::{
    MemoryStore, ObjectStore, PutCondition, S3Client, S3Config, SharedStore, StorageError,
};
use crmq::worker::{Batcher, BatcherConfig, Worker, WorkerConfig};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Identity provider that counts refreshes and can be told to fail.
#[derive(Debug, Default)]
pub struct CountingProvider {
    pub refreshes: AtomicUsize,
    pub failing: AtomicBool,
    pub delay: Duration,
}

impl CountingProvider {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingProvider {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::RefreshFailed {
                message: "identity provider unavailable".to_string(),
            });
        }
        Ok(TokenGrant {
            access_token: format!("access-{n}"),
            refresh_token: None,
            instance_url: "https://example.my.salesforce.com".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: Some(Duration::from_secs(3600)),
        })
    }
}

/// A backend that keeps time but cannot be reached for anything else.
#[derive(Debug, Default)]
pub struct UnreachableStore;

#[async_trait]
impl ObjectStore for UnreachableStore {
    async fn now(&self) -> Result<chrono::DateTime<Utc>, StorageError> {
        Ok(Utc::now())
    }

    async fn put_object(
        &self,
        _key: &str,
        _body: Vec<u8>,
        _condition: PutCondition,
    ) -> Result<String, StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }

    async fn get_object(&self, _key: &str) -> Result<(Vec<u8>, String), StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }

    async fn delete_object(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }

    async fn list_objects(
        &self,
        _prefix: &str,
        _limit: i32,
        _continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }
}

/// CRM double.
///
/// Single calls pop scripted results and succeed once the script is empty.
/// Bulk calls reject every record carrying a `"reject"` error code, classified
/// the way the CRM client classifies it.
#[derive(Debug, Default)]
pub struct FakeCrm {
    script: Mutex<VecDeque<Result<Value, ExecutionError>>>,
    pub calls: AtomicUsize,
    pub bulk_calls: AtomicUsize,
    pub bulk_records: AtomicUsize,
}

impl FakeCrm {
    pub fn push(&self, result: Result<Value, ExecutionError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn execute(
        &self,
        _token: &AccessToken,
        _operation: &CrmOperation,
    ) -> Result<Value, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "id": "001000000000001", "success": true })))
    }

    async fn execute_bulk(
        &self,
        _token: &AccessToken,
        _object_type: &str,
        _kind: TaskKind,
        records: &[Value],
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.bulk_records.fetch_add(records.len(), Ordering::SeqCst);
        Ok(records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                if let Some(code) = record.get("reject").and_then(Value::as_str) {
                    let category =
                        ErrorCategory::from_error_code(code).unwrap_or(ErrorCategory::Validation);
                    RecordOutcome::failed(category, format!("{code}: rejected by fake CRM"))
                } else {
                    RecordOutcome::Succeeded {
                        result: json!({ "id": format!("001{i:012}"), "success": true }),
                    }
                }
            })
            .collect())
    }
}

/// Everything a test needs, sharing one frozen in-memory store.
pub struct Harness {
    pub mem: Arc<MemoryStore>,
    pub store: TaskStore,
    pub admission: Arc<AdmissionController>,
    pub provider: Arc<CountingProvider>,
    pub credentials: Arc<CredentialCache>,
    pub crm: Arc<FakeCrm>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_limit(15_000)
    }

    /// Harness whose call budget allows `window_limit` calls per day.
    pub fn with_limit(window_limit: u64) -> Self {
        Self::build(window_limit, CountingProvider::default())
    }

    pub fn build(window_limit: u64, provider: CountingProvider) -> Self {
        let mem = Arc::new(MemoryStore::frozen(Utc::now()));
        let objects: SharedStore = mem.clone();
        let store = TaskStore::with_config(
            objects.clone(),
            StoreConfig {
                default_retry_policy: no_jitter(),
                ..StoreConfig::default()
            },
        );
        let admission = Arc::new(AdmissionController::new(
            objects.clone(),
            AdmissionConfig {
                window_limit,
                ..AdmissionConfig::default()
            },
        ));
        let provider = Arc::new(provider);
        let credentials = Arc::new(CredentialCache::new(
            objects,
            provider.clone(),
            CredentialConfig {
                bootstrap_refresh_token: Some("refresh-0".to_string()),
                ..CredentialConfig::default()
            },
        ));
        Self {
            mem,
            store,
            admission,
            provider,
            credentials,
            crm: Arc::new(FakeCrm::default()),
        }
    }

    pub fn worker(&self, worker_id: &str) -> Worker {
        Worker::new(
            self.store.clone(),
            self.admission.clone(),
            self.credentials.clone(),
            self.crm.clone(),
            WorkerConfig {
                worker_id: worker_id.to_string(),
                lease_batch_size: 10,
                ..WorkerConfig::default()
            },
        )
    }

    pub fn batcher(&self, config: BatcherConfig) -> Batcher {
        Batcher::new(
            self.store.clone(),
            self.admission.clone(),
            self.credentials.clone(),
            self.crm.clone(),
            config,
        )
    }

    /// Enqueues a single-record create and steps the clock so creation order is strict.
    pub async fn create(&self, name: &str, priority: u16) -> Task {
        let task = self
            .store
            .enqueue(NewTask::new(TaskKind::Create, "Account", json!({ "Name": name })).priority(priority))
            .await
            .unwrap();
        self.mem.advance(Duration::from_millis(1)).await;
        task
    }

    pub async fn bulk(&self, payload: Value) -> Task {
        let task = self
            .store
            .enqueue(NewTask::new(TaskKind::BulkCreate, "Contact", payload))
            .await
            .unwrap();
        self.mem.advance(Duration::from_millis(1)).await;
        task
    }

    pub async fn task(&self, id: Uuid) -> Task {
        self.store.get(id).await.unwrap().expect("task exists")
    }
}

/// Backoff without jitter so `available_at` is exact.
pub fn no_jitter() -> RetryPolicy {
    RetryPolicy::new(2_000, 300_000, 2.0, 0.0)
}

static INIT_BUCKET: OnceCell<()> = OnceCell::const_new();

/// Creates an S3 client from `S3_ENDPOINT`, `S3_BUCKET` and `S3_REGION`.
///
/// **For tests only:** defaults to LocalStack on `localhost:4566`.
///
/// # Panics
///
/// Panics if the S3 client cannot be created.
pub async fn s3_store() -> SharedStore {
    let endpoint = match std::env::var("S3_ENDPOINT") {
        Ok(val) if val.is_empty() => None,
        Ok(val) => Some(val),
        Err(_) => Some("http://localhost:4566".to_string()),
    };
    let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "crmq-dev".to_string());
    let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    eprintln!("Test config: endpoint={endpoint:?}, bucket={bucket}, region={region}");

    let client = S3Client::new(S3Config::new(endpoint, bucket, region))
        .await
        .expect("Failed to create S3 client - is LocalStack running?");
    INIT_BUCKET
        .get_or_init(|| async {
            if let Ok(keys) = client.list_objects_paginated("", 10_000).await {
                for key in keys {
                    let _ = client.delete_object(&key).await;
                }
            }
        })
        .await;
    Arc::new(client)
}
