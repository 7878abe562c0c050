//! Test: single-flight refresh and degraded serving.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crmq::auth::{AuthError, CredentialCache, CredentialConfig};
use crmq::storage::SharedStore;

use crate::common::{CountingProvider, Harness};

const CALLERS: usize = 64;

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let h = Harness::build(15_000, CountingProvider::slow(Duration::from_millis(100)));

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let credentials = h.credentials.clone();
        handles.push(tokio::spawn(async move { credentials.get_token().await }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(h.provider.count(), 1);
    assert!(tokens.iter().all(|t| t.token == tokens[0].token));

    h.credentials.get_token().await.unwrap();
    assert_eq!(h.provider.count(), 1, "fresh token served from memory");
}

#[tokio::test]
async fn test_failed_flight_gives_every_waiter_the_same_error() {
    let provider = CountingProvider::slow(Duration::from_millis(100));
    provider.failing.store(true, Ordering::SeqCst);
    let h = Harness::build(15_000, provider);

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let credentials = h.credentials.clone();
        handles.push(tokio::spawn(async move { credentials.get_token().await }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed { .. }), "{err:?}");
        assert!(!err.is_fatal());
    }
    assert_eq!(h.provider.count(), 1);
}

#[tokio::test]
async fn test_last_token_served_until_grace_expires() {
    let h = Harness::new();
    let original = h.credentials.get_token().await.unwrap();

    h.provider.failing.store(true, Ordering::SeqCst);
    h.mem.advance(Duration::from_secs(3600 - 300 + 1)).await;
    let degraded = h.credentials.get_token().await.unwrap();
    assert_eq!(degraded.token, original.token);
    assert!(h.credentials.last_failure().await.is_some());

    h.mem.advance(Duration::from_secs(600)).await;
    let err = h.credentials.get_token().await.unwrap_err();
    assert!(matches!(err, AuthError::GraceExpired { .. }));
    assert!(err.is_fatal());

    h.provider.failing.store(false, Ordering::SeqCst);
    h.mem.advance(Duration::from_secs(5)).await;
    let recovered = h.credentials.get_token().await.unwrap();
    assert_ne!(recovered.token, original.token);
    assert!(h.credentials.last_failure().await.is_none());
}

#[tokio::test]
async fn test_second_process_adopts_stored_credential() {
    let h = Harness::new();
    let first = h.credentials.get_token().await.unwrap();

    let objects: SharedStore = h.mem.clone();
    let other = CredentialCache::new(
        objects,
        h.provider.clone(),
        CredentialConfig {
            bootstrap_refresh_token: Some("refresh-0".to_string()),
            ..CredentialConfig::default()
        },
    );
    let adopted = other.get_token().await.unwrap();

    assert_eq!(adopted.token, first.token);
    assert_eq!(h.provider.count(), 1);
}

#[tokio::test]
async fn test_missing_refresh_token_is_fatal() {
    let h = Harness::new();
    let objects: SharedStore = h.mem.clone();
    let unconfigured = CredentialCache::new(
        objects,
        Arc::new(CountingProvider::default()),
        CredentialConfig::default(),
    );

    let err = unconfigured.get_token().await.unwrap_err();
    assert!(matches!(err, AuthError::NotAuthorized { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_processes_share_one_refresh() {
    let h = Harness::build(15_000, CountingProvider::slow(Duration::from_millis(200)));
    let objects: SharedStore = h.mem.clone();
    let caches: Vec<Arc<CredentialCache>> = (0..4)
        .map(|_| {
            Arc::new(CredentialCache::new(
                objects.clone(),
                h.provider.clone(),
                CredentialConfig {
                    bootstrap_refresh_token: Some("refresh-0".to_string()),
                    poll_interval: Duration::from_millis(20),
                    ..CredentialConfig::default()
                },
            ))
        })
        .collect();

    let mut handles = Vec::new();
    for cache in &caches {
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }
    }

    let mut tokens = HashSet::new();
    for handle in handles {
        tokens.insert(handle.await.unwrap().unwrap().token);
    }
    assert_eq!(h.provider.count(), 1);
    assert_eq!(tokens.len(), 1, "every process serves the same token: {tokens:?}");
}
