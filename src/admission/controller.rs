use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;

use super::window::{BudgetWindow, WINDOW_KEY};
use super::AdmissionError;
use crate::storage::{read_json, write_json, PutCondition, SharedStore, StorageError};

/// Settings for the shared call budget.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Calls allowed per window across every worker.
    pub window_limit: u64,
    pub window_duration: Duration,
    /// Conditional-write attempts before a request is denied as contended.
    pub cas_retries: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_limit: 15_000,
            window_duration: Duration::from_secs(24 * 60 * 60),
            cas_retries: 16,
        }
    }
}

/// A granted reservation of `cost` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    pub cost: u64,
    pub window_start: DateTime<Utc>,
    /// Budget left in the window after this grant.
    pub remaining: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The window does not have `cost` calls left.
    BudgetExhausted,
    /// `cost` is larger than a whole window.
    CostExceedsLimit,
    /// Too many concurrent writers on the window record.
    Contended,
}

/// A refused reservation. Nothing was consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
    /// How long until the budget can change.
    pub retry_after: Duration,
    pub consumed: u64,
    pub limit: u64,
}

/// Outcome of [`AdmissionController::acquire_permit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(Permit),
    Denied(Denial),
}

impl Admission {
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Snapshot of the current window for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub limit: u64,
    pub consumed: u64,
    pub remaining: u64,
}

/// Gatekeeper for the global CRM call budget.
///
/// The window lives in one object and every grant is a conditional write on
/// it, so `consumed` can never pass `window_limit` no matter how many
/// processes share the store. Callers in one process also take a local lock
/// first, which keeps them from burning CAS rounds against each other.
#[derive(Debug)]
pub struct AdmissionController {
    store: SharedStore,
    config: AdmissionConfig,
    local: Mutex<()>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(store: SharedStore, config: AdmissionConfig) -> Self {
        Self {
            store,
            config,
            local: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Reserves `cost` calls from the current window.
    ///
    /// Returns immediately with a grant or a denial; waiting is up to the
    /// caller. A cost of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Storage` if the window record cannot be read or written.
    pub async fn acquire_permit(&self, cost: u64) -> Result<Admission, AdmissionError> {
        let cost = cost.max(1);
        let _guard = self.local.lock().await;

        for _ in 0..=self.config.cas_retries {
            let now = self.store.now().await?;
            let (window, condition) = self.load(now).await?;

            if cost > window.window_limit {
                return Ok(self.deny(&window, now, DenialReason::CostExceedsLimit, cost));
            }
            if !window.fits(cost) {
                return Ok(self.deny(&window, now, DenialReason::BudgetExhausted, cost));
            }

            let mut next = window;
            next.consumed += cost;
            match write_json(&*self.store, WINDOW_KEY, &next, condition).await {
                Ok(_) => {
                    counter!("crmq.admission.granted").increment(1);
                    counter!("crmq.admission.consumed").increment(cost);
                    return Ok(Admission::Granted(Permit {
                        cost,
                        window_start: next.window_start,
                        remaining: next.remaining(),
                    }));
                }
                Err(StorageError::PreconditionFailed { .. }) => {
                    counter!("crmq.admission.conflict").increment(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = self.store.now().await?;
        let (window, _) = self.load(now).await?;
        tracing::warn!(cost, "Budget window contended; denying permit");
        Ok(self.deny(&window, now, DenialReason::Contended, cost))
    }

    /// The current window, rolled over if it has elapsed.
    pub async fn usage(&self) -> Result<BudgetUsage, AdmissionError> {
        let now = self.store.now().await?;
        let (window, _) = self.load(now).await?;
        Ok(BudgetUsage {
            window_start: window.window_start,
            resets_at: window.resets_at(),
            limit: window.window_limit,
            consumed: window.consumed,
            remaining: window.remaining(),
        })
    }

    async fn load(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(BudgetWindow, PutCondition), AdmissionError> {
        let limit = self.config.window_limit;
        let duration = self.config.window_duration;
        Ok(
            match read_json::<BudgetWindow>(&*self.store, WINDOW_KEY).await? {
                Some((window, etag)) => (
                    window.current(now, duration, limit),
                    PutCondition::IfMatch(etag),
                ),
                None => (
                    BudgetWindow::open(now, duration, limit),
                    PutCondition::IfNoneMatch,
                ),
            },
        )
    }

    #[allow(clippy::unused_self)]
    fn deny(
        &self,
        window: &BudgetWindow,
        now: DateTime<Utc>,
        reason: DenialReason,
        cost: u64,
    ) -> Admission {
        let retry_after = match reason {
            DenialReason::Contended => Duration::from_millis(250),
            DenialReason::BudgetExhausted | DenialReason::CostExceedsLimit => {
                window.retry_after(now)
            }
        };
        counter!("crmq.admission.denied").increment(1);
        tracing::debug!(
            cost,
            consumed = window.consumed,
            limit = window.window_limit,
            reason = ?reason,
            retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            "Permit denied"
        );
        Admission::Denied(Denial {
            reason,
            retry_after,
            consumed: window.consumed,
            limit: window.window_limit,
        })
    }
}
