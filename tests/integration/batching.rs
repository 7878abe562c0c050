//! Test: bulk tasks are folded into one call and resolved record by record.

use std::time::Duration;

use crmq::admission::Admission;
use crmq::models::{BatchStatus, TaskStatus};
use crmq::worker::BatcherConfig;
use serde_json::json;

use crate::common::Harness;

#[tokio::test]
async fn test_partial_bulk_failure_resolves_each_member() {
    let h = Harness::new();
    let mut rejected = Vec::new();
    let mut accepted = Vec::new();
    for i in 0..50 {
        let reject = i % 5 == 0;
        let task = h
            .bulk(json!({
                "LastName": format!("Contact {i}"),
                "reject": reject.then_some("UNABLE_TO_LOCK_ROW"),
            }))
            .await;
        if reject {
            rejected.push(task.id);
        } else {
            accepted.push(task.id);
        }
    }

    let report = h.batcher(BatcherConfig::default()).run_once().await.unwrap();

    assert_eq!(report.batches, 1);
    assert_eq!(report.records, 50);
    assert_eq!(report.succeeded, 40);
    assert_eq!(report.retried, 10);
    assert_eq!(h.crm.bulk_calls(), 1);

    for id in &accepted {
        let task = h.task(*id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.result.is_some());
    }
    for id in &rejected {
        let task = h.task(*id).await;
        assert_eq!(task.status, TaskStatus::FailedRetryable);
        assert_eq!(task.attempt, 1);
        assert!(task.error.as_deref().unwrap().starts_with("UNABLE_TO_LOCK_ROW"));
    }

    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.succeeded, 40);
    assert_eq!(stats.failed_retryable, 10);

    let usage = h.admission.usage().await.unwrap();
    assert_eq!(usage.consumed, 50, "one permit per record");

    let batch_id = h.task(accepted[0]).await.batch_id;
    if let Some(batch_id) = batch_id {
        let job = h.store.get_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(job.status, BatchStatus::Completed);
    }
}

#[tokio::test]
async fn test_permanent_record_rejection_dead_letters() {
    let h = Harness::new();
    let mut tasks = Vec::new();
    for i in 0..60 {
        let code = match i {
            0 => Some("DUPLICATE_VALUE"),
            1 => Some("REQUEST_LIMIT_EXCEEDED"),
            _ => None,
        };
        tasks.push(
            h.bulk(json!({ "LastName": format!("Lead {i}"), "reject": code }))
                .await,
        );
    }

    let report = h.batcher(BatcherConfig::default()).run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.succeeded, 58);

    let duplicate = h.task(tasks[0].id).await;
    assert_eq!(duplicate.status, TaskStatus::DeadLettered);
    assert_eq!(duplicate.attempt, 0);
    let throttled = h.task(tasks[1].id).await;
    assert_eq!(throttled.status, TaskStatus::FailedRetryable);
}

#[tokio::test]
async fn test_small_group_waits_for_max_wait() {
    let h = Harness::new();
    for i in 0..3 {
        h.bulk(json!({ "LastName": format!("Late {i}") })).await;
    }
    let batcher = h.batcher(BatcherConfig::default());

    let report = batcher.run_once().await.unwrap();
    assert_eq!(report.batches, 0);
    assert_eq!(h.crm.bulk_calls(), 0);

    h.mem.advance(Duration::from_secs(61)).await;
    let report = batcher.run_once().await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.succeeded, 3);
}

#[tokio::test]
async fn test_urgent_group_flushes_early() {
    let h = Harness::new();
    h.store
        .enqueue(
            crmq::models::NewTask::new(
                crmq::models::TaskKind::BulkUpdate,
                "Opportunity",
                json!({"Id": "006A", "StageName": "Closed Won"}),
            )
            .priority(1),
        )
        .await
        .unwrap();
    let batcher = h.batcher(BatcherConfig::default());

    assert_eq!(batcher.run_once().await.unwrap().batches, 0);
    h.mem.advance(Duration::from_secs(5)).await;
    assert_eq!(batcher.run_once().await.unwrap().batches, 1);
}

#[tokio::test]
async fn test_denied_batch_is_released_uncharged() {
    let h = Harness::with_limit(10);
    assert!(matches!(
        h.admission.acquire_permit(8).await.unwrap(),
        Admission::Granted(_)
    ));
    let mut ids = Vec::new();
    for i in 0..50 {
        ids.push(h.bulk(json!({ "LastName": format!("Held {i}") })).await.id);
    }

    let report = h.batcher(BatcherConfig::default()).run_once().await.unwrap();
    assert_eq!(report.batches, 0);
    assert_eq!(report.deferred, 10, "batch size is capped at the window limit");
    assert!(report.pause.is_some());
    assert_eq!(h.crm.bulk_calls(), 0);

    let usage = h.admission.usage().await.unwrap();
    assert_eq!(usage.consumed, 8);
    for id in ids {
        let task = h.task(id).await;
        assert_eq!(task.attempt, 0);
        assert!(task.batch_id.is_none());
        assert!(matches!(task.status, TaskStatus::Pending));
    }
}
