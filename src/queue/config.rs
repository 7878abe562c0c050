use std::time::Duration;

use crate::models::RetryPolicy;

/// Tunables for [`TaskStore`](super::TaskStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `max_attempts` for tasks that do not set one.
    pub default_max_attempts: u32,
    /// Backoff for tasks that do not set one.
    pub default_retry_policy: RetryPolicy,
    /// Ordering-index entries fetched per listing page.
    pub scan_limit: i32,
    /// Conditional-write retries before a transition reports contention.
    pub cas_retries: u32,
    /// Age after which an idempotency record pointing at a missing task is reusable.
    pub orphan_grace: Duration,
    /// Concurrent reads when scanning the task log.
    pub read_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_retry_policy: RetryPolicy::default(),
            scan_limit: 500,
            cas_retries: 8,
            orphan_grace: Duration::from_secs(60),
            read_concurrency: 32,
        }
    }
}
