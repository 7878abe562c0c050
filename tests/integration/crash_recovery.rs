//! Test: work held by a crashed process comes back without operator action.

use std::time::Duration;

use crmq::models::{BatchStatus, TaskKind, TaskStatus};
use crmq::worker::Sweeper;
use serde_json::json;

use crate::common::Harness;

const LEASE: Duration = Duration::from_secs(120);

#[tokio::test]
async fn test_crash_before_processing_reverts_to_pending() {
    let h = Harness::new();
    let task = h.create("orphan", 5).await;
    h.store.lease("crashed", 1, LEASE).await.unwrap();

    h.mem.advance(LEASE + Duration::from_secs(1)).await;
    let report = Sweeper::new(h.store.clone()).sweep_once().await.unwrap();
    assert_eq!(report.reverted, 1);

    let reverted = h.task(task.id).await;
    assert_eq!(reverted.status, TaskStatus::Pending);
    assert_eq!(reverted.attempt, 0);
    assert!(reverted.lease_owner.is_none());

    let report = h.worker("survivor").run_cycle().await.unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_crash_mid_call_charges_an_attempt() {
    let h = Harness::new();
    let task = h.create("mid-call", 5).await;
    h.store.lease("crashed", 1, LEASE).await.unwrap();
    h.store.mark_processing(task.id, "crashed").await.unwrap();

    h.mem.advance(LEASE).await;
    let report = Sweeper::new(h.store.clone()).sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);

    let recovered = h.task(task.id).await;
    assert_eq!(recovered.status, TaskStatus::FailedRetryable);
    assert_eq!(recovered.attempt, 1);
    assert!(recovered.error.as_deref().unwrap().contains("crashed"));

    let late = h.store.complete(task.id, "crashed", json!({})).await.unwrap_err();
    assert!(late.is_lease_lost(), "a stalled worker cannot report after recovery");
}

#[tokio::test]
async fn test_abandoned_batch_members_return() {
    let h = Harness::new();
    let a = h.bulk(json!({"LastName": "A"})).await;
    let b = h.bulk(json!({"LastName": "B"})).await;

    let batch = h
        .store
        .claim_batch("Contact", TaskKind::BulkCreate, &[a.id, b.id], LEASE)
        .await
        .unwrap()
        .unwrap();

    h.mem.advance(LEASE + Duration::from_secs(1)).await;
    let report = Sweeper::new(h.store.clone()).sweep_once().await.unwrap();
    assert_eq!(report.batches_abandoned, 1);
    assert_eq!(report.reverted, 2);

    let job = h.store.get_batch(batch.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, BatchStatus::Abandoned);
    for id in [a.id, b.id] {
        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.batch_id.is_none());
    }
}

#[tokio::test]
async fn test_sweep_is_quiet_on_a_healthy_queue() {
    let h = Harness::new();
    h.create("healthy", 5).await;
    h.store.lease("w1", 1, LEASE).await.unwrap();

    let report = Sweeper::new(h.store.clone()).sweep_once().await.unwrap();
    assert!(!report.changed());
    assert_eq!(report.scanned, 1);
}
