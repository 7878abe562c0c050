//! Test: the shared budget is never overspent and every request is answered.

use std::sync::Arc;
use std::time::Duration;

use crmq::admission::{Admission, AdmissionConfig, AdmissionController, DenialReason};
use crmq::storage::SharedStore;

use crate::common::Harness;

#[tokio::test]
async fn test_grants_and_denials_account_for_every_request() {
    let h = Harness::with_limit(100);

    // Separate controllers stand in for separate processes.
    let objects: SharedStore = h.mem.clone();
    let controllers: Vec<_> = (0..4)
        .map(|_| {
            Arc::new(AdmissionController::new(
                objects.clone(),
                AdmissionConfig {
                    window_limit: 100,
                    ..AdmissionConfig::default()
                },
            ))
        })
        .collect();

    let mut handles = Vec::new();
    for i in 0..160 {
        let controller = controllers[i % controllers.len()].clone();
        handles.push(tokio::spawn(async move {
            controller.acquire_permit(1).await.unwrap()
        }));
    }

    let (mut granted, mut denied) = (0u64, 0u64);
    for handle in handles {
        match handle.await.unwrap() {
            Admission::Granted(_) => granted += 1,
            Admission::Denied(_) => denied += 1,
        }
    }

    assert_eq!(granted + denied, 160);
    assert!(granted <= 100);
    let usage = h.admission.usage().await.unwrap();
    assert_eq!(usage.consumed, granted, "consumed equals the sum of grants");
}

#[tokio::test]
async fn test_denial_reports_window_reset() {
    let h = Harness::with_limit(3);
    assert!(h.admission.acquire_permit(3).await.unwrap().is_granted());

    match h.admission.acquire_permit(1).await.unwrap() {
        Admission::Denied(denial) => {
            assert_eq!(denial.reason, DenialReason::BudgetExhausted);
            let usage = h.admission.usage().await.unwrap();
            let now = h.store.now().await.unwrap();
            assert_eq!(denial.retry_after, (usage.resets_at - now).to_std().unwrap());
            assert!(denial.retry_after <= Duration::from_secs(24 * 60 * 60));
            assert_eq!(denial.consumed, 3);
        }
        Admission::Granted(p) => panic!("unexpected grant {p:?}"),
    }
}

#[tokio::test]
async fn test_window_rolls_over() {
    let h = Harness::with_limit(2);
    assert!(h.admission.acquire_permit(2).await.unwrap().is_granted());
    assert!(!h.admission.acquire_permit(1).await.unwrap().is_granted());

    h.mem.advance(Duration::from_secs(24 * 60 * 60)).await;
    let usage = h.admission.usage().await.unwrap();
    assert_eq!(usage.consumed, 0);
    assert!(h.admission.acquire_permit(2).await.unwrap().is_granted());
}

#[tokio::test]
async fn test_cost_above_limit_is_never_granted() {
    let h = Harness::with_limit(50);
    match h.admission.acquire_permit(51).await.unwrap() {
        Admission::Denied(denial) => assert_eq!(denial.reason, DenialReason::CostExceedsLimit),
        Admission::Granted(_) => panic!("granted more than a window"),
    }
    assert_eq!(h.admission.usage().await.unwrap().consumed, 0);
}
