use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Storage key of the shared budget window.
pub const WINDOW_KEY: &str = "admission/window.json";

/// The shared call budget for the current window.
///
/// Windows are aligned to multiples of their duration since the Unix epoch,
/// so every process derives the same boundaries from the store clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindow {
    pub window_start: DateTime<Utc>,
    pub window_duration_secs: u64,
    pub window_limit: u64,
    pub consumed: u64,
}

impl BudgetWindow {
    /// A fresh window containing `now`.
    #[must_use]
    pub fn open(now: DateTime<Utc>, duration: Duration, limit: u64) -> Self {
        let secs = duration_secs(duration);
        Self {
            window_start: aligned_start(now, secs),
            window_duration_secs: secs,
            window_limit: limit,
            consumed: 0,
        }
    }

    /// When the window closes.
    #[must_use]
    pub fn resets_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.window_duration_secs).unwrap_or(i64::MAX);
        self.window_start
            .checked_add_signed(chrono::Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.resets_at()
    }

    /// The window as seen at `now` under the given settings.
    ///
    /// Rolls over to a fresh window when this one has elapsed or its duration
    /// changed. The limit always follows the caller's setting.
    #[must_use]
    pub fn current(self, now: DateTime<Utc>, duration: Duration, limit: u64) -> Self {
        if self.is_expired_at(now) || self.window_duration_secs != duration_secs(duration) {
            return Self::open(now, duration, limit);
        }
        Self {
            window_limit: limit,
            ..self
        }
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.window_limit.saturating_sub(self.consumed)
    }

    /// True if `cost` more calls stay within the limit.
    #[must_use]
    pub const fn fits(&self, cost: u64) -> bool {
        match self.consumed.checked_add(cost) {
            Some(total) => total <= self.window_limit,
            None => false,
        }
    }

    /// Time from `now` until the window resets.
    #[must_use]
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.resets_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}

fn duration_secs(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

fn aligned_start(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let span = i64::try_from(secs).unwrap_or(i64::MAX);
    let ts = now.timestamp();
    let start = ts - ts.rem_euclid(span);
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_open_aligns_to_duration() {
        let window = BudgetWindow::open(at(1_000_123), Duration::from_secs(60), 10);
        assert_eq!(window.window_start, at(1_000_080));
        assert_eq!(window.resets_at(), at(1_000_140));
        assert_eq!(window.remaining(), 10);
    }

    #[test]
    fn test_current_keeps_consumption_inside_window() {
        let mut window = BudgetWindow::open(at(600), Duration::from_secs(60), 10);
        window.consumed = 7;
        let same = window.current(at(659), Duration::from_secs(60), 10);
        assert_eq!(same.consumed, 7);
        assert_eq!(same.remaining(), 3);
    }

    #[test]
    fn test_current_rolls_over_lazily() {
        let mut window = BudgetWindow::open(at(600), Duration::from_secs(60), 10);
        window.consumed = 10;
        let next = window.current(at(725), Duration::from_secs(60), 10);
        assert_eq!(next.window_start, at(720));
        assert_eq!(next.consumed, 0);
    }

    #[test]
    fn test_fits_and_retry_after() {
        let mut window = BudgetWindow::open(at(0), Duration::from_secs(100), 5);
        window.consumed = 4;
        assert!(window.fits(1));
        assert!(!window.fits(2));
        assert!(!window.fits(u64::MAX));
        assert_eq!(window.retry_after(at(30)), Duration::from_secs(70));
        assert_eq!(window.retry_after(at(130)), Duration::ZERO);
    }

    #[test]
    fn test_lowered_limit_leaves_nothing_remaining() {
        let mut window = BudgetWindow::open(at(0), Duration::from_secs(60), 100);
        window.consumed = 50;
        let lowered = window.current(at(10), Duration::from_secs(60), 20);
        assert_eq!(lowered.remaining(), 0);
        assert!(!lowered.fits(1));
    }
}
