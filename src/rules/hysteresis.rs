//! Consecutive-cycle counters that keep a noisy condition from flapping an
//! alert open and closed
//!
//! ```text
//! condition true:  true_streak += 1, false_streak = 0
//!                  true_streak >= window  → Open
//! condition false: false_streak += 1, true_streak = 0
//!                  false_streak >= window → Clear
//! ```
//!
//! The tracker does not know whether an alert is open; the lifecycle layer
//! turns `Open` into an upsert (a no-op while one is open) and `Clear` into a
//! resolve of whatever is open.

use std::collections::HashMap;

use crate::storage::AlertKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Streak {
    true_streak: u32,
    false_streak: u32,
}

/// What the lifecycle layer should do with an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not enough consecutive cycles yet
    Hold,
    Open,
    Clear,
}

#[derive(Debug, Default)]
pub struct HysteresisTracker {
    streaks: HashMap<AlertKey, Streak>,
}

impl HysteresisTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, key: &AlertKey, condition: bool, window: u32) -> Verdict {
        let window = window.max(1);
        let streak = self.streaks.entry(key.clone()).or_default();

        if condition {
            streak.true_streak = streak.true_streak.saturating_add(1);
            streak.false_streak = 0;
            if streak.true_streak >= window {
                return Verdict::Open;
            }
        } else {
            streak.false_streak = streak.false_streak.saturating_add(1);
            streak.true_streak = 0;
            if streak.false_streak >= window {
                return Verdict::Clear;
            }
        }
        Verdict::Hold
    }

    /// Drop counters for keys that have been clear long enough to be
    /// indistinguishable from never seen.
    pub fn prune(&mut self, max_idle: u32) {
        self.streaks
            .retain(|_, s| s.true_streak > 0 || s.false_streak < max_idle);
    }

    pub fn len(&self) -> usize {
        self.streaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streaks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AlertKey {
        AlertKey::new("r1", "cpu_utilization", "")
    }

    #[test]
    fn test_opens_only_after_window() {
        let mut tracker = HysteresisTracker::new();
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Open);
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Open);
    }

    #[test]
    fn test_single_noisy_sample_does_not_clear() {
        let mut tracker = HysteresisTracker::new();
        tracker.observe(&key(), true, 2);
        tracker.observe(&key(), true, 2);

        assert_eq!(tracker.observe(&key(), false, 2), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Open);
    }

    #[test]
    fn test_clears_after_window() {
        let mut tracker = HysteresisTracker::new();
        tracker.observe(&key(), true, 3);
        assert_eq!(tracker.observe(&key(), false, 3), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), false, 3), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), false, 3), Verdict::Clear);
    }

    #[test]
    fn test_window_of_one_is_immediate() {
        let mut tracker = HysteresisTracker::new();
        assert_eq!(tracker.observe(&key(), true, 1), Verdict::Open);
        assert_eq!(tracker.observe(&key(), false, 1), Verdict::Clear);
        // zero is treated as one
        assert_eq!(tracker.observe(&key(), true, 0), Verdict::Open);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut tracker = HysteresisTracker::new();
        let other = AlertKey::new("r2", "cpu_utilization", "");

        tracker.observe(&key(), true, 2);
        assert_eq!(tracker.observe(&other, true, 2), Verdict::Hold);
        assert_eq!(tracker.observe(&key(), true, 2), Verdict::Open);
    }

    #[test]
    fn test_prune_forgets_long_clear_keys() {
        let mut tracker = HysteresisTracker::new();
        let firing = AlertKey::new("r2", "cpu_utilization", "");

        for _ in 0..5 {
            tracker.observe(&key(), false, 2);
        }
        tracker.observe(&firing, true, 2);

        tracker.prune(5);
        assert_eq!(tracker.len(), 1);
    }
}
