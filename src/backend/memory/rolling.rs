//! Rolling-window tracker: reserved amounts expire a window after admission.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};

#[derive(Debug)]
struct Reservation {
    lease_id: String,
    amount: u64,
}

#[derive(Debug)]
pub(super) struct RollingLimit {
    pub(super) capacity: u64,
    used: u64,
    /// Min-heap of (expiry, sequence).
    expiries: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    live: HashMap<u64, Reservation>,
    by_lease: HashMap<String, u64>,
}

impl RollingLimit {
    pub(super) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            expiries: BinaryHeap::new(),
            live: HashMap::new(),
            by_lease: HashMap::new(),
        }
    }

    pub(super) fn used(&self) -> u64 {
        self.used
    }

    pub(super) fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub(super) fn would_exceed(&self, amount: u64) -> bool {
        self.used.saturating_add(amount) > self.capacity
    }

    /// Drop every reservation whose expiry is at or before `now`.
    pub(super) fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse((expires_at, seq))) = self.expiries.peek().copied() {
            if expires_at > now {
                break;
            }
            self.expiries.pop();
            if let Some(res) = self.live.remove(&seq) {
                self.used = self.used.saturating_sub(res.amount);
                if self.by_lease.get(&res.lease_id) == Some(&seq) {
                    self.by_lease.remove(&res.lease_id);
                }
            }
        }
    }

    pub(super) fn add(&mut self, seq: u64, lease_id: &str, amount: u64, expires_at: DateTime<Utc>) {
        self.live.insert(
            seq,
            Reservation {
                lease_id: lease_id.to_string(),
                amount,
            },
        );
        self.by_lease.insert(lease_id.to_string(), seq);
        self.used = self.used.saturating_add(amount);
        self.expiries.push(Reverse((expires_at, seq)));
    }

    /// Shrink a live reservation to `new_amount`; growing is a no-op.
    pub(super) fn reduce(&mut self, lease_id: &str, new_amount: u64) {
        let Some(seq) = self.by_lease.get(lease_id) else {
            return;
        };
        let Some(res) = self.live.get_mut(seq) else {
            return;
        };
        if new_amount >= res.amount {
            return;
        }
        let diff = res.amount - new_amount;
        self.used = self.used.saturating_sub(diff);
        res.amount = new_amount;
    }
}
