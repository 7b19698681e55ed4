use dashmap::DashMap;

use crate::ratelimit::types::LimitKey;

/// Consecutive denials per key, driving the backoff curve.
#[derive(Debug, Default)]
pub(super) struct DenyTracker {
    streaks: DashMap<LimitKey, u32>,
}

impl DenyTracker {
    pub(super) fn increment(&self, key: &LimitKey) -> u32 {
        let mut streak = self.streaks.entry(key.clone()).or_insert(0);
        *streak = streak.saturating_add(1);
        *streak
    }

    pub(super) fn reset(&self, key: &LimitKey) {
        self.streaks.remove(key);
    }

    #[cfg(test)]
    pub(super) fn streak(&self, key: &LimitKey) -> u32 {
        self.streaks.get(key).map_or(0, |s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streak_counts_and_resets() {
        let tracker = DenyTracker::default();
        let key = LimitKey::from("k");
        assert_eq!(tracker.increment(&key), 1);
        assert_eq!(tracker.increment(&key), 2);
        tracker.reset(&key);
        assert_eq!(tracker.streak(&key), 0);
        assert_eq!(tracker.increment(&key), 1);
    }
}
