//! Worker-count hint for an external supervisor.
//!
//! crmq never starts or stops workers. A supervisor polls [`ScalePolicy::hint`]
//! (or `crmq scale-hint --json`) and runs that many worker processes.

use serde::{Deserialize, Serialize};

use crate::models::QueueStats;

/// Feedback rule from queue depth to worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalePolicy {
    /// Waiting plus in-flight tasks one worker is expected to keep up with.
    pub tasks_per_worker: u64,
    pub min_workers: u32,
    pub max_workers: u32,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            tasks_per_worker: 50,
            min_workers: 1,
            max_workers: 20,
        }
    }
}

/// Suggested worker count with the numbers it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleHint {
    pub desired_workers: u32,
    pub backlog: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

impl ScalePolicy {
    /// `ceil((backlog + in_flight) / tasks_per_worker)`, clamped to `[min_workers, max_workers]`.
    ///
    /// Dead letters need an operator, not more workers, so they are ignored.
    #[must_use]
    pub fn desired_workers(&self, stats: &QueueStats) -> u32 {
        let load = stats.backlog() + stats.in_flight();
        let wanted = load.div_ceil(self.tasks_per_worker.max(1));
        let max = self.max_workers.max(self.min_workers);
        u32::try_from(wanted).unwrap_or(u32::MAX).clamp(self.min_workers, max)
    }

    #[must_use]
    pub fn hint(&self, stats: &QueueStats) -> ScaleHint {
        ScaleHint {
            desired_workers: self.desired_workers(stats),
            backlog: stats.backlog(),
            in_flight: stats.in_flight(),
            dead_lettered: stats.dead_lettered,
        }
    }
}
