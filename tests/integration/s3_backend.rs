//! Test: the lease and budget protocols against a real S3-compatible store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crmq::admission::{AdmissionConfig, AdmissionController};
use crmq::models::{NewTask, TaskKind, TaskStatus};
use crmq::queue::{StoreError, TaskStore};
use serde_json::json;
use uuid::Uuid;

use crate::common::s3_store;

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_enqueue_lease_complete() {
    let store = TaskStore::new(s3_store().await);
    let marker = Uuid::new_v4().to_string();
    let task = store
        .enqueue(NewTask::new(TaskKind::Create, "Account", json!({ "Name": marker })))
        .await
        .expect("Failed to enqueue");

    let err = store
        .enqueue(NewTask::new(TaskKind::Create, "Account", json!({ "Name": marker })))
        .await
        .expect_err("duplicate accepted");
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey { .. }));

    let mut leased = None;
    for _ in 0..20 {
        let batch = store
            .lease("s3-worker", 50, Duration::from_secs(60))
            .await
            .expect("Lease failed");
        if let Some(t) = batch.into_iter().find(|t| t.id == task.id) {
            leased = Some(t);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let leased = leased.expect("task was never leased");
    assert_eq!(leased.status, TaskStatus::Leased);

    store.mark_processing(task.id, "s3-worker").await.unwrap();
    let done = store
        .complete(task.id, "s3-worker", json!({"id": "001"}))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_concurrent_leases_are_exclusive() {
    let store = TaskStore::new(s3_store().await);
    let object_type = format!("Test{}", Uuid::new_v4().simple());
    let mut ours = HashSet::new();
    for i in 0..10 {
        let task = store
            .enqueue(NewTask::new(TaskKind::Create, &object_type, json!({ "n": i })))
            .await
            .unwrap();
        ours.insert(task.id);
    }

    let mut handles = Vec::new();
    for w in 0..5 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .lease(&format!("s3-w{w}"), 100, Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for task in handle.await.unwrap() {
            if ours.contains(&task.id) {
                assert!(seen.insert(task.id), "task {} leased twice", task.id);
            }
        }
    }
}

#[tokio::test]
#[cfg_attr(
    not(feature = "integration"),
    ignore = "requires S3 (enable feature integration)"
)]
async fn test_budget_never_overspent() {
    let objects = s3_store().await;
    let config = AdmissionConfig {
        window_limit: 20,
        window_duration: Duration::from_secs(7 * 24 * 60 * 60),
        ..AdmissionConfig::default()
    };
    let controllers: Vec<_> = (0..3)
        .map(|_| Arc::new(AdmissionController::new(objects.clone(), config.clone())))
        .collect();
    let before = controllers[0].usage().await.unwrap().consumed;

    let mut handles = Vec::new();
    for i in 0..30 {
        let controller = controllers[i % 3].clone();
        handles.push(tokio::spawn(async move {
            controller.acquire_permit(1).await.unwrap().is_granted()
        }));
    }
    let mut granted = 0;
    for handle in handles {
        granted += u64::from(handle.await.unwrap());
    }

    let usage = controllers[0].usage().await.unwrap();
    assert!(usage.consumed <= 20);
    assert_eq!(usage.consumed, before + granted);
}
