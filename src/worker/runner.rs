//! The worker loop.
//!
//! Each cycle leases a few tasks, then for each one obtains a token and a
//! budget permit, runs the CRM call, and reports the outcome to the store.
//! A task that cannot run because of the budget or the credential is
//! released without charging an attempt. Every wait is a bounded sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::signal;
use tokio::sync::watch;

use super::{PollingStrategy, WorkerError};
use crate::admission::{Admission, AdmissionController};
use crate::auth::{AccessToken, CredentialCache};
use crate::crm::{CrmClient, CrmOperation, ErrorCategory, ExecutionError};
use crate::models::{Task, TaskStatus};
use crate::queue::{LeaseFilter, StoreError, TaskStore};

/// Settings for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Tasks leased per cycle.
    pub lease_batch_size: usize,
    /// Must comfortably exceed `request_timeout`.
    pub lease_duration: Duration,
    /// Bound on one CRM call.
    pub request_timeout: Duration,
    pub polling: PollingStrategy,
    /// Longest sleep after a budget denial.
    pub max_pause: Duration,
    /// Pause and release delay while the credential is unavailable.
    pub auth_retry_delay: Duration,
    /// Also take bulk kinds, one record at a time.
    pub include_bulk: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease_batch_size: 5,
            lease_duration: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            polling: PollingStrategy::default(),
            max_pause: Duration::from_secs(60),
            auth_retry_delay: Duration::from_secs(5),
            include_bulk: false,
        }
    }
}

/// `worker-` followed by a random suffix.
#[must_use]
pub fn default_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..12])
}

/// What happened to one leased task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retried,
    DeadLettered,
    /// Released uncharged; the worker should pause this long.
    Deferred { pause: Duration },
    /// The lease was gone before the outcome could be recorded.
    Lost,
}

/// Tally of one cycle, or of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub leased: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub lost: usize,
    /// Set when the cycle stopped early and the loop should back off.
    pub pause: Option<Duration>,
}

impl CycleReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Retried => self.retried += 1,
            TaskOutcome::DeadLettered => self.dead_lettered += 1,
            TaskOutcome::Deferred { pause } => {
                self.deferred += 1;
                self.pause = Some(pause);
            }
            TaskOutcome::Lost => self.lost += 1,
        }
    }

    /// Adds another report's counts.
    pub fn absorb(&mut self, other: &Self) {
        self.leased += other.leased;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.lost += other.lost;
    }
}

/// A worker bound to the shared store, budget, credential and CRM.
#[derive(Debug, Clone)]
pub struct Worker {
    store: TaskStore,
    admission: Arc<AdmissionController>,
    credentials: Arc<CredentialCache>,
    crm: Arc<dyn CrmClient>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(
        store: TaskStore,
        admission: Arc<AdmissionController>,
        credentials: Arc<CredentialCache>,
        crm: Arc<dyn CrmClient>,
        config: WorkerConfig,
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
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs one lease-execute-report cycle.
    ///
    /// # Errors
    ///
    /// Returns a fatal `WorkerError::Auth` when the credential is past its
    /// grace period, or a store error if leasing itself failed. Per-task
    /// failures are recorded on the task and never returned.
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkerError> {
        let filter = if self.config.include_bulk {
            LeaseFilter::Any
        } else {
            LeaseFilter::SingleRecord
        };
        let tasks = self
            .store
            .lease_matching(
                self.id(),
                self.config.lease_batch_size,
                self.config.lease_duration,
                &filter,
            )
            .await?;

        let mut report = CycleReport {
            leased: tasks.len(),
            ..CycleReport::default()
        };
        let mut remaining = tasks.iter();
        while let Some(task) = remaining.next() {
            let outcome = match self.process(task).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release(task, Duration::ZERO).await;
                    self.release_all(remaining, Duration::ZERO).await;
                    return Err(e);
                }
            };
            report.record(outcome);
            if let TaskOutcome::Deferred { pause } = outcome {
                report.deferred += self.release_all(remaining, pause).await;
                break;
            }
        }
        Ok(report)
    }

    /// Takes one leased task through to a recorded outcome.
    async fn process(&self, task: &Task) -> Result<TaskOutcome, WorkerError> {
        let token = match self.credentials.get_token().await {
            Ok(token) => token,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Credential unavailable; deferring task");
                let pause = self.config.auth_retry_delay;
                self.release(task, pause).await;
                return Ok(TaskOutcome::Deferred { pause });
            }
        };

        if let Admission::Denied(denial) = self.admission.acquire_permit(1).await? {
            let pause = denial.retry_after.min(self.config.max_pause);
            tracing::debug!(task_id = %task.id, reason = ?denial.reason, ?pause, "Call budget exhausted; deferring task");
            self.release(task, pause).await;
            return Ok(TaskOutcome::Deferred { pause });
        }

        match self.store.mark_processing(task.id, self.id()).await {
            Ok(_) => {}
            Err(e) if e.is_lease_lost() => {
                tracing::warn!(task_id = %task.id, worker_id = self.id(), "Lease lost before execution");
                return Ok(TaskOutcome::Lost);
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.execute(task, &token).await;
        let recorded = match result {
            Ok(value) => self.store.complete(task.id, self.id(), value).await,
            Err(e) => {
                if e.is_session_expired() {
                    self.credentials.invalidate(&token).await;
                }
                self.store
                    .fail(task.id, self.id(), &e.to_string(), e.is_retryable())
                    .await
            }
        };
        outcome_of(recorded, task, self.id())
    }

    async fn execute(&self, task: &Task, token: &AccessToken) -> Result<serde_json::Value, ExecutionError> {
        let operation = CrmOperation::from_task(task)?;
        let started = Instant::now();
        let result = tokio::time::timeout(self.config.request_timeout, self.crm.execute(token, &operation))
            .await
            .unwrap_or_else(|_| {
                Err(ExecutionError::new(
                    ErrorCategory::Timeout,
                    format!("no response within {:?}", self.config.request_timeout),
                ))
            });
        histogram!("crmq.execute.duration_seconds", "kind" => task.kind.as_str())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn release(&self, task: &Task, delay: Duration) -> bool {
        match self.store.release(task.id, self.id(), delay).await {
            Ok(_) => true,
            // Already processing or no longer ours.
            Err(e) if e.is_lease_lost() => false,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to release task");
                false
            }
        }
    }

    async fn release_all<'a>(
        &self,
        tasks: impl Iterator<Item = &'a Task> + Send,
        delay: Duration,
    ) -> usize {
        let mut released = 0;
        for task in tasks {
            if self.release(task, delay).await {
                released += 1;
            }
        }
        released
    }

    /// Runs cycles until `shutdown` flips to `true`.
    ///
    /// Returns the accumulated counts on clean shutdown.
    ///
    /// # Errors
    ///
    /// Returns only fatal errors; anything else is logged and retried after a pause.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<CycleReport, WorkerError> {
        tracing::info!(
            worker_id = self.id(),
            lease_batch_size = self.config.lease_batch_size,
            lease_duration = ?self.config.lease_duration,
            polling = ?self.config.polling,
            "Worker started"
        );

        let polling = &self.config.polling;
        let mut interval = polling.initial_interval();
        let mut totals = CycleReport::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    totals.absorb(&report);
                    if let Some(pause) = report.pause {
                        Some(pause)
                    } else if report.leased > 0 {
                        interval = polling.next_interval(interval, true);
                        None
                    } else {
                        let sleep = polling.apply_jitter(interval);
                        interval = polling.next_interval(interval, false);
                        Some(sleep)
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(worker_id = self.id(), error = %e, "Worker cannot make progress; stopping");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(worker_id = self.id(), error = %e, "Worker cycle failed");
                    Some(polling.apply_jitter(interval))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(
            worker_id = self.id(),
            succeeded = totals.succeeded,
            retried = totals.retried,
            dead_lettered = totals.dead_lettered,
            deferred = totals.deferred,
            "Worker shutdown complete"
        );
        Ok(totals)
    }
}

fn outcome_of(
    recorded: Result<Task, StoreError>,
    task: &Task,
    worker_id: &str,
) -> Result<TaskOutcome, WorkerError> {
    match recorded {
        Ok(updated) => Ok(match updated.status {
            TaskStatus::Succeeded => TaskOutcome::Succeeded,
            TaskStatus::DeadLettered => TaskOutcome::DeadLettered,
            _ => TaskOutcome::Retried,
        }),
        Err(e) if e.is_lease_lost() => {
            counter!("crmq.tasks.outcome_discarded").increment(1);
            tracing::warn!(task_id = %task.id, worker_id, "Lease lost during execution; outcome discarded");
            Ok(TaskOutcome::Lost)
        }
        Err(e) => Err(e.into()),
    }
}

/// Creates the channel used to stop workers.
#[must_use]
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Waits for SIGINT or SIGTERM, then flips `shutdown_tx` to `true`.
pub async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    if shutdown_tx.send(true).is_err() {
        tracing::debug!("No loops left to stop");
    }
}
