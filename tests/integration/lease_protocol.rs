//! Test: lease ordering, exclusivity and expiry.

use std::collections::HashSet;
use std::time::Duration;

use crmq::models::TaskStatus;
use crmq::queue::StoreError;
use serde_json::json;

use crate::common::Harness;

const LEASE: Duration = Duration::from_secs(120);

#[tokio::test]
async fn test_lease_takes_lowest_priority_then_oldest() {
    let h = Harness::new();
    let low = h.create("low", 2).await;
    let first = h.create("first", 1).await;
    let second = h.create("second", 1).await;

    let leased = h.store.lease("w1", 2, LEASE).await.unwrap();

    let ids: Vec<_> = leased.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert!(leased.iter().all(|t| t.status == TaskStatus::Leased));
    assert!(leased.iter().all(|t| t.lease_owner.as_deref() == Some("w1")));

    let untouched = h.task(low.id).await;
    assert_eq!(untouched.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_empty_queue_leases_nothing() {
    let h = Harness::new();
    assert!(h.store.lease("w1", 5, LEASE).await.unwrap().is_empty());
    assert!(h.store.lease("w1", 0, LEASE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_task() {
    let h = Harness::new();
    for i in 0..40 {
        h.create(&format!("acct-{i}"), 5).await;
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            store.lease(&format!("w{w}"), 10, LEASE).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for task in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(task.id), "task {} leased twice", task.id);
        }
    }
    assert_eq!(total, 40);
    assert!(h.store.lease("late", 10, LEASE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable_and_stale_holder_is_fenced() {
    let h = Harness::new();
    let task = h.create("reclaim", 5).await;

    let first = h.store.lease("w1", 1, LEASE).await.unwrap();
    assert_eq!(first[0].id, task.id);
    assert!(h.store.lease("w2", 1, LEASE).await.unwrap().is_empty());

    h.mem.advance(LEASE + Duration::from_secs(1)).await;
    let stats = h.store.stats().await.unwrap();
    assert_eq!(stats.pending, 1, "expired lease reads as waiting");

    let second = h.store.lease("w2", 1, LEASE).await.unwrap();
    assert_eq!(second[0].id, task.id);
    assert_eq!(second[0].lease_owner.as_deref(), Some("w2"));

    let err = h.store.mark_processing(task.id, "w1").await.unwrap_err();
    assert!(err.is_lease_lost());
    h.store.mark_processing(task.id, "w2").await.unwrap();
}

#[tokio::test]
async fn test_mark_processing_after_expiry_is_lease_lost() {
    let h = Harness::new();
    let task = h.create("slow", 5).await;
    h.store.lease("w1", 1, LEASE).await.unwrap();

    h.mem.advance(LEASE).await;
    let err = h.store.mark_processing(task.id, "w1").await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));
}

#[tokio::test]
async fn test_release_is_uncharged() {
    let h = Harness::new();
    let task = h.create("deferred", 5).await;
    h.store.lease("w1", 1, LEASE).await.unwrap();

    let released = h
        .store
        .release(task.id, "w1", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.attempt, 0);
    assert_eq!(released.deferrals, 1);
    assert!(released.lease_owner.is_none());

    assert!(h.store.lease("w1", 1, LEASE).await.unwrap().is_empty());
    h.mem.advance(Duration::from_secs(30)).await;
    assert_eq!(h.store.lease("w2", 1, LEASE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_bulk_kinds_are_skipped_by_single_record_filter() {
    use crmq::queue::LeaseFilter;

    let h = Harness::new();
    h.bulk(json!({"LastName": "Ng"})).await;
    let single = h.create("single", 9).await;

    let leased = h
        .store
        .lease_matching("w1", 5, LEASE, &LeaseFilter::SingleRecord)
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, single.id);
}

#[tokio::test]
async fn test_late_worker_reaches_task_behind_held_page() {
    let h = Harness::new();
    for i in 0..500 {
        h.create(&format!("held-{i}"), 1).await;
    }
    let waiting = h.create("waiting", 1).await;

    let mut held = 0;
    for w in 0..100 {
        held += h.store.lease(&format!("w{w}"), 5, LEASE).await.unwrap().len();
    }
    assert_eq!(held, 500);

    let late = h.store.lease("late", 5, LEASE).await.unwrap();
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].id, waiting.id);
}
