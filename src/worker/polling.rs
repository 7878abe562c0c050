//! Sleep cadence between worker cycles.
//!
//! - `Fixed`: the same pause after every idle cycle
//! - `Adaptive`: pauses grow while the queue is idle and snap back once a
//!   cycle makes progress

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a loop sleeps after a cycle that found nothing to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PollingStrategy {
    Fixed {
        interval_ms: u64,
    },
    Adaptive {
        /// Pause right after a productive cycle.
        min_interval_ms: u64,
        /// Ceiling for an idle queue.
        max_interval_ms: u64,
        /// Growth per idle cycle.
        backoff_multiplier: f64,
    },
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self::Adaptive {
            min_interval_ms: 250,
            max_interval_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollingStrategy {
    #[must_use]
    pub const fn fixed(interval_ms: u64) -> Self {
        Self::Fixed { interval_ms }
    }

    #[must_use]
    pub const fn adaptive(min_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self::Adaptive {
            min_interval_ms,
            max_interval_ms,
            backoff_multiplier: 2.0,
        }
    }

    #[must_use]
    pub const fn initial_interval(&self) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms, ..
            } => Duration::from_millis(*min_interval_ms),
        }
    }

    /// The pause to use after a cycle, given the previous one.
    #[must_use]
    pub fn next_interval(&self, current: Duration, made_progress: bool) -> Duration {
        match self {
            Self::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Self::Adaptive {
                min_interval_ms, ..
            } if made_progress => Duration::from_millis(*min_interval_ms),
            Self::Adaptive {
                min_interval_ms,
                max_interval_ms,
                backoff_multiplier,
            } => {
                let grown = current
                    .max(Duration::from_millis(*min_interval_ms))
                    .mul_f64(backoff_multiplier.max(1.0));
                grown.min(Duration::from_millis(*max_interval_ms))
            }
        }
    }

    /// Spreads `interval` by +/-10% so idle workers do not poll in lockstep.
    #[must_use]
    pub fn apply_jitter(&self, interval: Duration) -> Duration {
        interval.mul_f64(rand::random::<f64>().mul_add(0.2, 0.9))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_grows_then_caps() {
        let strategy = PollingStrategy::adaptive(100, 500);
        let mut interval = strategy.initial_interval();
        let mut seen = Vec::new();
        for _ in 0..4 {
            interval = strategy.next_interval(interval, false);
            seen.push(interval.as_millis());
        }
        assert_eq!(seen, vec![200, 400, 500, 500]);
    }

    #[test]
    fn test_progress_resets_adaptive() {
        let strategy = PollingStrategy::adaptive(100, 5_000);
        assert_eq!(
            strategy.next_interval(Duration::from_secs(4), true),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_fixed_never_changes() {
        let strategy = PollingStrategy::fixed(750);
        assert_eq!(
            strategy.next_interval(Duration::from_secs(9), false),
            Duration::from_millis(750)
        );
        assert_eq!(strategy.initial_interval(), Duration::from_millis(750));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let strategy = PollingStrategy::default();
        for _ in 0..100 {
            let ms = strategy.apply_jitter(Duration::from_secs(1)).as_millis();
            assert!((900..=1_100).contains(&ms), "{ms}ms");
        }
    }

    #[test]
    fn test_toml_shape() {
        let parsed: PollingStrategy =
            toml::from_str("strategy = \"fixed\"\ninterval_ms = 500").unwrap_or_default();
        assert_eq!(parsed, PollingStrategy::fixed(500));
    }
}
