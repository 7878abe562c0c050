//! Periodic coalescing of bulk tasks into bulk CRM calls.
//!
//! Each pass looks at eligible bulk tasks grouped by `(object_type, kind)`,
//! decides which groups are worth flushing, and for each one claims up to
//! `max_batch_size` members in priority order, takes one permit weighted by
//! member count, submits one bulk call and hands each record's outcome back
//! to its task. Members of a batch go through the same `complete`/`fail`
//! transitions as individually executed tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::watch;

use super::WorkerError;
use crate::admission::{Admission, AdmissionController};
use crate::auth::{AccessToken, CredentialCache};
use crate::crm::{CrmClient, ErrorCategory, ExecutionError};
use crate::models::RecordOutcome;
use crate::queue::{BatchGroup, BatchReport, ClaimedBatch, TaskStore};

/// Settings for the batcher.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Group size that is flushed without waiting.
    pub min_batch_size: usize,
    /// Most members per batch job.
    pub max_batch_size: usize,
    /// A group whose oldest member waited this long is flushed whatever its size.
    pub max_wait: Duration,
    /// Members with `priority <= high_priority_threshold` count as urgent.
    pub high_priority_threshold: u16,
    /// An urgent member never waits longer than this.
    pub high_priority_max_wait: Duration,
    /// Lease on claimed members; must exceed `request_timeout`.
    pub lease_duration: Duration,
    /// Bound on one bulk call.
    pub request_timeout: Duration,
    /// Pause between passes.
    pub interval: Duration,
    /// Longest pause after a budget denial.
    pub max_pause: Duration,
    pub auth_retry_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 50,
            max_batch_size: 200,
            max_wait: Duration::from_secs(60),
            high_priority_threshold: 2,
            high_priority_max_wait: Duration::from_secs(5),
            lease_duration: Duration::from_secs(300),
            request_timeout: Duration::from_secs(120),
            interval: Duration::from_secs(2),
            max_pause: Duration::from_secs(60),
            auth_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Why a group was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The group reached `min_batch_size`.
    Size,
    /// An urgent member reached `high_priority_max_wait`.
    Urgent,
    /// The oldest member reached `max_wait`.
    MaxWait,
}

impl FlushReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Urgent => "urgent",
            Self::MaxWait => "max_wait",
        }
    }
}

/// Tally of one batcher pass, or of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherReport {
    /// Bulk calls made.
    pub batches: usize,
    /// Records sent across those calls.
    pub records: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub lost: usize,
    /// Members handed back without a call.
    pub deferred: usize,
    /// Set when the pass stopped on a denial or an auth outage.
    pub pause: Option<Duration>,
}

impl BatcherReport {
    fn absorb_batch(&mut self, report: &BatchReport) {
        self.succeeded += report.succeeded;
        self.retried += report.retried;
        self.dead_lettered += report.dead_lettered;
        self.lost += report.lost;
    }

    fn absorb(&mut self, other: &Self) {
        self.batches += other.batches;
        self.records += other.records;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.lost += other.lost;
        self.deferred += other.deferred;
    }
}

/// Folds bulk tasks into bulk calls.
#[derive(Debug, Clone)]
pub struct Batcher {
    store: TaskStore,
    admission: Arc<AdmissionController>,
    credentials: Arc<CredentialCache>,
    crm: Arc<dyn CrmClient>,
    config: BatcherConfig,
}

enum Submitted {
    Done(BatchReport),
    Deferred(Duration),
}

impl Batcher {
    #[must_use]
    pub fn new(
        store: TaskStore,
        admission: Arc<AdmissionController>,
        credentials: Arc<CredentialCache>,
        crm: Arc<dyn CrmClient>,
        config: BatcherConfig,
    ) -> Self {
        Self {
            store,
            admission,
            credentials,
            crm,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Decides whether `group` should be flushed at `now`.
    #[must_use]
    pub fn flush_reason(&self, group: &BatchGroup, now: DateTime<Utc>) -> Option<FlushReason> {
        let waited = |since: DateTime<Utc>| (now - since).to_std().unwrap_or_default();

        if group.len() >= self.config.min_batch_size.max(1) {
            return Some(FlushReason::Size);
        }
        if group
            .urgent_waiting_since(self.config.high_priority_threshold)
            .is_some_and(|since| waited(since) >= self.config.high_priority_max_wait)
        {
            return Some(FlushReason::Urgent);
        }
        if group
            .oldest_waiting_since()
            .is_some_and(|since| waited(since) >= self.config.max_wait)
        {
            return Some(FlushReason::MaxWait);
        }
        None
    }

    /// Runs one pass over the current candidates.
    ///
    /// # Errors
    ///
    /// Returns a fatal `WorkerError::Auth` past the credential grace period,
    /// or a store error if the candidates cannot be read.
    pub async fn run_once(&self) -> Result<BatcherReport, WorkerError> {
        let now = self.store.now().await?;
        let groups = self.store.batch_candidates().await?;
        let limit = usize::try_from(self.admission.config().window_limit).unwrap_or(usize::MAX);
        let max = self.config.max_batch_size.clamp(1, limit.max(1));

        let mut report = BatcherReport::default();
        for group in groups {
            let Some(reason) = self.flush_reason(&group, now) else {
                continue;
            };
            let ids: Vec<_> = group.ids().into_iter().take(max).collect();
            let Some(batch) = self
                .store
                .claim_batch(&group.object_type, group.kind, &ids, self.config.lease_duration)
                .await?
            else {
                continue;
            };

            match self.submit(batch, reason).await? {
                (Submitted::Done(batch_report), records) => {
                    report.batches += usize::from(records > 0);
                    report.records += records;
                    report.absorb_batch(&batch_report);
                }
                (Submitted::Deferred(pause), released) => {
                    report.deferred += released;
                    report.pause = Some(pause);
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Takes a claimed batch through one bulk call. Returns the member count
    /// sent, or released on deferral.
    #[allow(clippy::cast_precision_loss)]
    async fn submit(
        &self,
        batch: ClaimedBatch,
        reason: FlushReason,
    ) -> Result<(Submitted, usize), WorkerError> {
        let token = match self.credentials.get_token().await {
            Ok(token) => token,
            Err(e) if e.is_fatal() => {
                self.store.release_batch(&batch, Duration::ZERO).await?;
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(batch_id = %batch.job.id, error = %e, "Credential unavailable; releasing batch");
                let pause = self.config.auth_retry_delay;
                let released = self.store.release_batch(&batch, pause).await?;
                return Ok((Submitted::Deferred(pause), released));
            }
        };

        let cost = batch.len() as u64;
        if let Admission::Denied(denial) = self.admission.acquire_permit(cost).await? {
            let pause = denial.retry_after.min(self.config.max_pause);
            tracing::debug!(batch_id = %batch.job.id, cost, reason = ?denial.reason, ?pause, "Call budget exhausted; releasing batch");
            let released = self.store.release_batch(&batch, pause).await?;
            return Ok((Submitted::Deferred(pause), released));
        }

        let batch = self.store.start_batch(batch).await?;
        if batch.is_empty() {
            return Ok((Submitted::Done(BatchReport::default()), 0));
        }

        counter!("crmq.batch.flushed", "reason" => reason.as_str()).increment(1);
        histogram!("crmq.batch.size").record(batch.len() as f64);
        tracing::info!(
            batch_id = %batch.job.id,
            object_type = %batch.job.object_type,
            kind = %batch.job.kind,
            members = batch.len(),
            reason = reason.as_str(),
            "Submitting batch"
        );

        let report = match self.execute(&batch, &token).await {
            Ok(outcomes) => self.store.resolve_batch(&batch, outcomes).await?,
            Err(e) => {
                if e.is_session_expired() {
                    self.credentials.invalidate(&token).await;
                }
                tracing::warn!(batch_id = %batch.job.id, error = %e, "Bulk call failed");
                self.store
                    .fail_batch(&batch, &e.to_string(), e.is_retryable())
                    .await?
            }
        };
        Ok((Submitted::Done(report), batch.len()))
    }

    async fn execute(
        &self,
        batch: &ClaimedBatch,
        token: &AccessToken,
    ) -> Result<Vec<RecordOutcome>, ExecutionError> {
        let records = batch.records();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.request_timeout,
            self.crm
                .execute_bulk(token, &batch.job.object_type, batch.job.kind, &records),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ExecutionError::new(
                ErrorCategory::Timeout,
                format!("no bulk response within {:?}", self.config.request_timeout),
            ))
        });
        histogram!("crmq.execute.duration_seconds", "kind" => batch.job.kind.as_str())
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Runs passes every `interval` until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns only fatal errors.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BatcherReport, WorkerError> {
        tracing::info!(
            min_batch_size = self.config.min_batch_size,
            max_batch_size = self.config.max_batch_size,
            max_wait = ?self.config.max_wait,
            interval = ?self.config.interval,
            "Batcher started"
        );

        let mut totals = BatcherReport::default();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(report) => {
                    totals.absorb(&report);
                    report.pause.unwrap_or(self.config.interval)
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Batcher cannot make progress; stopping");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Batcher pass failed");
                    self.config.interval
                }
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!(
            batches = totals.batches,
            records = totals.records,
            succeeded = totals.succeeded,
            "Batcher shutdown complete"
        );
        Ok(totals)
    }
}
