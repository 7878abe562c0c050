use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule applied between retryable failures.
///
/// Delay for failure `n` (0-indexed) is `base * multiplier^n`, capped at
/// `max_delay_ms`, then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first retryable failure, in milliseconds.
    pub base_delay_ms: u32,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u32,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Relative jitter in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `jitter` is clamped to `[0.0, 1.0]`.
    #[must_use]
    pub const fn new(base_delay_ms: u32, max_delay_ms: u32, multiplier: f64, jitter: f64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that makes retried tasks available again immediately.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::new(0, 0, 1.0, 0.0)
    }

    /// Delay before the task may be leased again after failure number `failures`.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let capped = self.capped_ms(failures);
        let jitter = self.jitter.abs().min(1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        Duration::from_millis(saturating_ms(capped * factor))
    }

    /// Same as [`backoff`](Self::backoff) with jitter disabled.
    #[must_use]
    pub fn backoff_without_jitter(&self, failures: u32) -> Duration {
        Duration::from_millis(saturating_ms(self.capped_ms(failures)))
    }

    fn capped_ms(&self, failures: u32) -> f64 {
        const MAX_EXPONENT: i32 = 30;
        let exponent = i32::try_from(failures).map_or(MAX_EXPONENT, |e| e.min(MAX_EXPONENT));
        let raw = f64::from(self.base_delay_ms) * self.multiplier.powi(exponent);
        raw.min(f64::from(self.max_delay_ms))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn saturating_ms(ms: f64) -> u64 {
    if !ms.is_finite() || ms <= 0.0 {
        0
    } else if ms >= f64::from(u32::MAX) {
        u64::from(u32::MAX)
    } else {
        ms as u64
    }
}
