//! Test: a worker cycle end to end against the fake CRM.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crmq::admission::{AdmissionConfig, AdmissionController};
use crmq::crm::{ErrorCategory, ExecutionError};
use crmq::models::TaskStatus;
use crmq::worker::{shutdown_signal, TaskOutcome, Worker, WorkerConfig, WorkerError};
use serde_json::json;

use crate::common::{CountingProvider, Harness, UnreachableStore};

#[tokio::test]
async fn test_cycle_executes_leased_tasks() {
    let h = Harness::new();
    let a = h.create("a", 5).await;
    let b = h.create("b", 5).await;

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.leased, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(h.crm.calls(), 2);

    for id in [a.id, b.id] {
        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.completed_by.as_deref(), Some("w1"));
    }
    assert_eq!(h.admission.usage().await.unwrap().consumed, 2);
    assert_eq!(h.provider.count(), 1, "token is reused across tasks");
}

#[tokio::test]
async fn test_denied_permit_leaves_task_waiting_and_uncharged() {
    let h = Harness::with_limit(1);
    let first = h.create("first", 1).await;
    let second = h.create("second", 2).await;

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.deferred, 1);
    assert!(report.pause.is_some());
    assert_eq!(h.crm.calls(), 1, "no call without a permit");

    assert_eq!(h.task(first.id).await.status, TaskStatus::Succeeded);
    let waiting = h.task(second.id).await;
    assert_eq!(waiting.status, TaskStatus::Pending);
    assert_eq!(waiting.attempt, 0);
    assert_eq!(waiting.deferrals, 1);
    assert!(waiting.lease_owner.is_none());

    let usage = h.admission.usage().await.unwrap();
    assert_eq!(usage.consumed, 1);
    assert_eq!(usage.remaining, 0);
}

#[tokio::test]
async fn test_denial_stops_the_cycle_and_releases_the_rest() {
    let h = Harness::with_limit(0);
    for i in 0..4 {
        h.create(&format!("held-{i}"), 5).await;
    }

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.leased, 4);
    assert_eq!(report.deferred, 4);
    assert_eq!(h.crm.calls(), 0);

    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.pending, 4);
    assert_eq!(stats.leased, 0);
}

#[tokio::test]
async fn test_budget_store_outage_hands_every_task_back() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(h.create(&format!("outage-{i}"), 5).await.id);
    }
    let worker = Worker::new(
        h.store.clone(),
        Arc::new(AdmissionController::new(
            Arc::new(UnreachableStore),
            AdmissionConfig::default(),
        )),
        h.credentials.clone(),
        h.crm.clone(),
        WorkerConfig {
            worker_id: "w1".to_string(),
            lease_batch_size: 10,
            ..WorkerConfig::default()
        },
    );

    let err = worker.run_cycle().await.unwrap_err();
    assert!(matches!(err, WorkerError::Admission(_)), "{err:?}");
    assert!(!err.is_fatal());
    assert_eq!(h.crm.calls(), 0);

    for id in ids {
        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Pending, "task {id} still held");
        assert!(task.lease_owner.is_none());
        assert_eq!(task.attempt, 0);
    }
}

#[tokio::test]
async fn test_expired_session_refreshes_token_once() {
    let h = Harness::new();
    let task = h.create("session", 5).await;
    h.crm.push(Err(ExecutionError::new(
        ErrorCategory::SessionExpired,
        "INVALID_SESSION_ID: Session expired or invalid",
    )));

    let worker = h.worker("w1");
    worker.run_cycle().await.unwrap();
    assert_eq!(h.task(task.id).await.status, TaskStatus::FailedRetryable);
    assert_eq!(h.provider.count(), 1);

    h.mem.advance(Duration::from_secs(5)).await;
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.provider.count(), 2, "rejected token is not served again");
}

#[tokio::test]
async fn test_provider_outage_defers_without_charging() {
    let provider = CountingProvider::default();
    provider.failing.store(true, Ordering::SeqCst);
    let h = Harness::build(15_000, provider);
    let task = h.create("no-token", 5).await;

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(h.crm.calls(), 0);

    let waiting = h.task(task.id).await;
    assert_eq!(waiting.status, TaskStatus::Pending);
    assert_eq!(waiting.attempt, 0);
    assert_eq!(h.admission.usage().await.unwrap().consumed, 0);
}

#[tokio::test]
async fn test_bulk_kinds_left_for_the_batcher() {
    let h = Harness::new();
    h.bulk(json!({"LastName": "Batch"})).await;

    let report = h.worker("w1").run_cycle().await.unwrap();
    assert_eq!(report.leased, 0);
    assert_eq!(h.store.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = Harness::new();
    h.create("before-shutdown", 5).await;
    let worker = h.worker("w1");
    let (tx, rx) = shutdown_signal();

    let handle = tokio::spawn(async move { worker.run(rx).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();

    let totals = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .unwrap()
        .unwrap();
    assert_eq!(totals.succeeded, 1);
}

#[test]
fn test_outcome_pause_only_on_deferral() {
    let pause = Duration::from_secs(3);
    assert_eq!(
        TaskOutcome::Deferred { pause },
        TaskOutcome::Deferred { pause }
    );
    assert_ne!(TaskOutcome::Succeeded, TaskOutcome::Lost);
}
