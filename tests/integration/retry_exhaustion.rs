//! Test: retryable failures back off until the attempt ceiling, then dead-letter.

use std::time::Duration;

use crmq::crm::{ErrorCategory, ExecutionError};
use crmq::models::{NewTask, TaskKind, TaskStatus};
use serde_json::json;

use crate::common::Harness;

const LEASE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_attempts_climb_then_dead_letter() {
    let h = Harness::new();
    let task = h
        .store
        .enqueue(
            NewTask::new(TaskKind::Update, "Account", json!({"Id": "001", "Name": "x"}))
                .max_attempts(2),
        )
        .await
        .unwrap();

    let mut attempts = Vec::new();
    loop {
        let leased = h.store.lease("w1", 1, LEASE).await.unwrap();
        if leased.is_empty() {
            h.mem.advance(Duration::from_secs(600)).await;
            continue;
        }
        h.store.mark_processing(task.id, "w1").await.unwrap();
        let after = h
            .store
            .fail(task.id, "w1", "UNABLE_TO_LOCK_ROW", true)
            .await
            .unwrap();
        attempts.push((after.attempt, after.status));
        if after.status.is_terminal() {
            break;
        }
    }

    assert_eq!(
        attempts,
        vec![
            (1, TaskStatus::FailedRetryable),
            (2, TaskStatus::FailedRetryable),
            (2, TaskStatus::DeadLettered),
        ]
    );
    let dead = h.task(task.id).await;
    assert_eq!(dead.error.as_deref(), Some("UNABLE_TO_LOCK_ROW"));
    assert!(h.store.lease("w1", 1, LEASE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backoff_delays_next_lease() {
    let h = Harness::new();
    let task = h.create("backoff", 5).await;
    h.store.lease("w1", 1, LEASE).await.unwrap();
    h.store.mark_processing(task.id, "w1").await.unwrap();
    let failed = h.store.fail(task.id, "w1", "timeout", true).await.unwrap();

    let now = h.store.now().await.unwrap();
    assert_eq!(
        failed.available_at - now,
        chrono::Duration::milliseconds(2_000)
    );
    assert!(h.store.lease("w1", 1, LEASE).await.unwrap().is_empty());

    h.mem.advance(Duration::from_secs(2)).await;
    let again = h.store.lease("w2", 1, LEASE).await.unwrap();
    assert_eq!(again[0].attempt, 1);
    assert_eq!(again[0].status, TaskStatus::Leased);
}

#[tokio::test]
async fn test_worker_dead_letters_permanent_error_immediately() {
    let h = Harness::new();
    let task = h.create("bad-field", 5).await;
    h.crm.push(Err(ExecutionError::new(
        ErrorCategory::Malformed,
        "INVALID_FIELD: No such column 'Nmae'",
    )));

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let dead = h.task(task.id).await;
    assert_eq!(dead.status, TaskStatus::DeadLettered);
    assert_eq!(dead.attempt, 0);
    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.failed_retryable, 0);
}

#[tokio::test]
async fn test_worker_retries_transient_error() {
    let h = Harness::new();
    let task = h.create("locked", 5).await;
    h.crm.push(Err(ExecutionError::new(
        ErrorCategory::RateLimited,
        "REQUEST_LIMIT_EXCEEDED",
    )));

    let worker = h.worker("w1");
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(h.task(task.id).await.status, TaskStatus::FailedRetryable);

    h.mem.advance(Duration::from_secs(5)).await;
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
    let done = h.task(task.id).await;
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.attempt, 1);
    assert_eq!(h.crm.calls(), 2);
}

#[tokio::test]
async fn test_complete_is_idempotent_for_the_same_worker() {
    let h = Harness::new();
    let task = h.create("twice", 5).await;
    h.store.lease("w1", 1, LEASE).await.unwrap();
    h.store.mark_processing(task.id, "w1").await.unwrap();

    let first = h.store.complete(task.id, "w1", json!({"id": 1})).await.unwrap();
    let second = h.store.complete(task.id, "w1", json!({"id": 1})).await.unwrap();
    assert_eq!(first, second);

    let err = h.store.complete(task.id, "w2", json!({})).await.unwrap_err();
    assert!(err.is_lease_lost());
}
