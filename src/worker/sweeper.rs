//! Repair pass over the task log.
//!
//! Leasing already treats an expired lease as eligible, so the sweeper is not
//! needed for correctness. It keeps observable state tidy: expired `Leased`
//! tasks read as waiting again, tasks abandoned mid-call are charged their
//! retry, the ordering index matches the task records, and batch jobs whose
//! holder vanished are closed.

use std::collections::HashSet;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;

use crate::models::{parse_open_index_key, TaskStatus, OPEN_INDEX_PREFIX};
use crate::queue::{StoreError, TaskStore};

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Expired `Leased` tasks returned to waiting.
    pub reverted: usize,
    /// `Processing` tasks whose lease ran out, charged as a retryable failure.
    pub recovered: usize,
    /// Missing index entries written back.
    pub index_repaired: usize,
    /// Index entries pointing at nothing, a finished task, or the wrong slot.
    pub index_removed: usize,
    pub batches_abandoned: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.reverted
            + self.recovered
            + self.index_repaired
            + self.index_removed
            + self.batches_abandoned
            > 0
    }
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    store: TaskStore,
}

impl Sweeper {
    #[must_use]
    pub const fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Runs one full sweep.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task log or the index cannot be listed.
    /// Failures on individual tasks are logged and skipped.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let now = self.store.now().await?;

        let index: HashSet<String> = self
            .store
            .object_store()
            .list_objects_paginated(OPEN_INDEX_PREFIX, i32::MAX)
            .await?
            .into_iter()
            .collect();

        let tasks = self.store.scan_tasks().await?;
        report.scanned = tasks.len();
        let mut expected = HashSet::with_capacity(tasks.len());

        for task in tasks {
            let mut current = task;
            if current.status == TaskStatus::Leased && !current.has_live_lease(now) {
                match self.store.revert_expired_lease(current.id).await {
                    Ok(Some(task)) => {
                        report.reverted += 1;
                        current = task;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %current.id, error = %e, "Failed to revert expired lease");
                    }
                }
            } else if current.is_abandoned_at(now) {
                match self.store.recover_abandoned(current.id).await {
                    Ok(Some(task)) => {
                        report.recovered += 1;
                        current = task;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %current.id, error = %e, "Failed to recover abandoned task");
                    }
                }
            }

            if current.status.is_terminal() {
                continue;
            }
            let key = current.open_index_key();
            if !index.contains(&key) {
                self.store.create_index(&current).await;
                report.index_repaired += 1;
                tracing::debug!(task_id = %current.id, "Restored missing index entry");
            }
            expected.insert(key);
        }

        for key in index.difference(&expected) {
            if parse_open_index_key(key).is_none() {
                tracing::debug!(key = %key, "Removing unparseable index entry");
            }
            self.store.delete_index_key(key).await;
            report.index_removed += 1;
        }

        report.batches_abandoned = self.store.abandon_expired_batches().await?;

        counter!("crmq.sweep.reverted").increment(report.reverted as u64);
        counter!("crmq.sweep.index_repaired")
            .increment((report.index_repaired + report.index_removed) as u64);
        if report.changed() {
            tracing::info!(
                scanned = report.scanned,
                reverted = report.reverted,
                recovered = report.recovered,
                index_repaired = report.index_repaired,
                index_removed = report.index_removed,
                batches_abandoned = report.batches_abandoned,
                "Sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(?interval, "Sweeper started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Sweep failed");
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Sweeper stopped");
    }
}
