//! Concurrency tracker: one hold per in-flight lease, expiring on timeout.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

#[derive(Debug)]
pub(super) struct ConcurrencyLimit {
    pub(super) capacity: u64,
    holds: HashMap<String, u64>,
    expiries: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    live: HashMap<u64, String>,
}

impl ConcurrencyLimit {
    pub(super) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            holds: HashMap::new(),
            expiries: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    pub(super) fn holds(&self) -> usize {
        self.holds.len()
    }

    pub(super) fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.holds.len() as u64)
    }

    pub(super) fn is_full(&self) -> bool {
        self.holds.len() as u64 + 1 > self.capacity
    }

    pub(super) fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((expires_at, seq))) = self.expiries.peek().copied() {
            if expires_at > now {
                break;
            }
            self.expiries.pop();
            if let Some(lease_id) = self.live.remove(&seq) {
                if self.holds.get(&lease_id) == Some(&seq) {
                    self.holds.remove(&lease_id);
                }
            }
        }
    }

    pub(super) fn add(&mut self, seq: u64, lease_id: &str, expires_at: DateTime<Utc>) {
        if let Some(prev) = self.holds.insert(lease_id.to_string(), seq) {
            self.live.remove(&prev);
        }
        self.live.insert(seq, lease_id.to_string());
        self.expiries.push(Reverse((expires_at, seq)));
    }

    pub(super) fn release(&mut self, lease_id: &str) {
        if let Some(seq) = self.holds.remove(lease_id) {
            self.live.remove(&seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_holds_fill_and_release() {
        let now = Utc::now();
        let mut limit = ConcurrencyLimit::new(2);
        limit.add(1, "a", now + Duration::seconds(30));
        assert!(!limit.is_full());
        limit.add(2, "b", now + Duration::seconds(30));
        assert!(limit.is_full());

        limit.release("a");
        assert_eq!(limit.holds(), 1);
        assert_eq!(limit.available(), 1);
    }

    #[test]
    fn test_expired_hold_is_evicted() {
        let now = Utc::now();
        let mut limit = ConcurrencyLimit::new(1);
        limit.add(1, "a", now + Duration::seconds(1));
        limit.evict_expired(now);
        assert_eq!(limit.holds(), 1);
        limit.evict_expired(now + Duration::seconds(1));
        assert_eq!(limit.holds(), 0);
    }

    #[test]
    fn test_stale_expiry_does_not_drop_new_hold() {
        let now = Utc::now();
        let mut limit = ConcurrencyLimit::new(1);
        limit.add(1, "a", now + Duration::seconds(1));
        limit.release("a");
        limit.add(2, "a", now + Duration::seconds(60));

        limit.evict_expired(now + Duration::seconds(2));
        assert_eq!(limit.holds(), 1);
    }
}
