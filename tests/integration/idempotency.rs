//! Test: duplicate submissions are rejected until the holder is dead-lettered.

use std::time::Duration;

use crmq::models::{NewTask, TaskKind, TaskStatus};
use crmq::queue::StoreError;
use serde_json::json;

use crate::common::Harness;

fn upsert(name: &str) -> NewTask {
    NewTask::new(TaskKind::Create, "Lead", json!({ "LastName": name }))
}

#[tokio::test]
async fn test_duplicate_content_is_rejected() {
    let h = Harness::new();
    let first = h.store.enqueue(upsert("Ng")).await.unwrap();

    let err = h.store.enqueue(upsert("Ng")).await.unwrap_err();
    match err {
        StoreError::DuplicateIdempotencyKey {
            existing_task_id, ..
        } => assert_eq!(existing_task_id, first.id),
        other => panic!("unexpected {other:?}"),
    }

    h.store.enqueue(upsert("Okafor")).await.unwrap();
    assert_eq!(h.store.stats().await.unwrap().pending, 2);
}

#[tokio::test]
async fn test_explicit_key_overrides_content() {
    let h = Harness::new();
    h.store
        .enqueue(upsert("A").idempotency_key("import-42"))
        .await
        .unwrap();
    let err = h
        .store
        .enqueue(upsert("B").idempotency_key("import-42"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey { .. }));
}

#[tokio::test]
async fn test_succeeded_task_keeps_its_key() {
    let h = Harness::new();
    let task = h.store.enqueue(upsert("Done")).await.unwrap();
    h.store.lease("w1", 1, Duration::from_secs(60)).await.unwrap();
    h.store.mark_processing(task.id, "w1").await.unwrap();
    h.store.complete(task.id, "w1", json!({"id": "00Q1"})).await.unwrap();

    let err = h.store.enqueue(upsert("Done")).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdempotencyKey { .. }));
}

#[tokio::test]
async fn test_dead_lettered_key_can_be_resubmitted() {
    let h = Harness::new();
    let task = h.store.enqueue(upsert("Broken")).await.unwrap();
    h.store.lease("w1", 1, Duration::from_secs(60)).await.unwrap();
    h.store.mark_processing(task.id, "w1").await.unwrap();
    let dead = h
        .store
        .fail(task.id, "w1", "INVALID_FIELD: No such column", false)
        .await
        .unwrap();
    assert_eq!(dead.status, TaskStatus::DeadLettered);

    let again = h.store.enqueue(upsert("Broken")).await.unwrap();
    assert_ne!(again.id, task.id);
    assert_eq!(again.status, TaskStatus::Pending);

    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_admit_exactly_one() {
    let h = Harness::new();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move { store.enqueue(upsert("Race")).await }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(StoreError::DuplicateIdempotencyKey { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(created, 1);
}
