//! Reservation records kept by an engine between Reserve and Complete.

use std::collections::HashMap;

use super::types::{LimitDefinition, LimitKey, Requirement};

/// How long a lease outlives its last hold before it is pruned, so a late
/// Complete still finds it.
pub const LEASE_RETENTION_MS: i64 = 5 * 60 * 1000;

/// A live reservation, keyed by lease id inside the engine that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    pub lease_id: String,
    pub reserved_at_unix_ms: i64,
    pub requirements: Vec<Requirement>,
    pub reserved_amounts: HashMap<LimitKey, u64>,
    /// When the last hold of the lease lapses; `i64::MAX` never does.
    pub expires_at_unix_ms: i64,
}

impl LeaseState {
    pub fn new(lease_id: impl Into<String>, reserved_at_unix_ms: i64, requirements: Vec<Requirement>) -> Self {
        let reserved_amounts = index_by_key(&requirements);
        Self {
            lease_id: lease_id.into(),
            reserved_at_unix_ms,
            requirements,
            reserved_amounts,
            expires_at_unix_ms: i64::MAX,
        }
    }

    /// Expire with the longest hold among `defs`. A zero hold never expires.
    pub fn with_holds(mut self, defs: &[LimitDefinition]) -> Self {
        if defs.is_empty() {
            return self;
        }
        let mut longest = 0i64;
        for def in defs {
            let hold_ms = i64::try_from(def.hold_duration().as_millis()).unwrap_or(i64::MAX);
            if hold_ms == 0 {
                return self;
            }
            longest = longest.max(hold_ms);
        }
        self.expires_at_unix_ms = self.reserved_at_unix_ms.saturating_add(longest);
        self
    }

    /// Whether the lease lapsed more than [`LEASE_RETENTION_MS`] before `now_ms`.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        self.expires_at_unix_ms.saturating_add(LEASE_RETENTION_MS) <= now_ms
    }

    pub fn reserved(&self, key: &LimitKey) -> u64 {
        self.reserved_amounts.get(key).copied().unwrap_or(0)
    }

    /// Whether a repeated Reserve for this lease asks for the same thing.
    pub fn matches(&self, requirements: &[Requirement]) -> bool {
        requirements_equal(&self.requirements, requirements)
    }
}

/// Drop stale leases; returns how many were removed.
pub fn prune_stale(leases: &mut HashMap<String, LeaseState>, now_ms: i64) -> usize {
    let before = leases.len();
    leases.retain(|_, lease| !lease.is_stale(now_ms));
    before - leases.len()
}

/// Total requested amount per key; a repeated key accumulates.
pub fn index_by_key(requirements: &[Requirement]) -> HashMap<LimitKey, u64> {
    let mut out: HashMap<LimitKey, u64> = HashMap::with_capacity(requirements.len());
    for r in requirements {
        let total = out.entry(r.key.clone()).or_insert(0);
        *total = total.saturating_add(r.amount);
    }
    out
}

/// Distinct keys with their total amounts, in first-seen order.
pub fn merge_by_key(requirements: &[Requirement]) -> Vec<Requirement> {
    let mut merged: Vec<Requirement> = Vec::with_capacity(requirements.len());
    for r in requirements {
        match merged.iter_mut().find(|m| m.key == r.key) {
            Some(m) => m.amount = m.amount.saturating_add(r.amount),
            None => merged.push(r.clone()),
        }
    }
    merged
}

/// Order-insensitive equality of two requirement lists.
pub fn requirements_equal(a: &[Requirement], b: &[Requirement]) -> bool {
    a.len() == b.len() && index_by_key(a) == index_by_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirements_equal_ignores_order() {
        let a = vec![Requirement::new("a", 1), Requirement::new("b", 2)];
        let b = vec![Requirement::new("b", 2), Requirement::new("a", 1)];
        assert!(requirements_equal(&a, &b));
    }

    #[test]
    fn test_requirements_differ() {
        let a = vec![Requirement::new("a", 1)];
        assert!(!requirements_equal(&a, &[Requirement::new("a", 2)]));
        assert!(!requirements_equal(&a, &[Requirement::new("b", 1)]));
        assert!(!requirements_equal(&a, &[]));
    }

    #[test]
    fn test_merge_by_key_sums_repeats() {
        let merged = merge_by_key(&[
            Requirement::new("a", 1),
            Requirement::new("b", 2),
            Requirement::new("a", 3),
        ]);
        assert_eq!(merged, vec![Requirement::new("a", 4), Requirement::new("b", 2)]);
    }

    #[test]
    fn test_lease_reserved_amounts() {
        let lease = LeaseState::new("l1", 10, vec![Requirement::new("tpm", 40)]);
        assert_eq!(lease.reserved(&LimitKey::from("tpm")), 40);
        assert_eq!(lease.reserved(&LimitKey::from("rpm")), 0);
        assert!(lease.matches(&[Requirement::new("tpm", 40)]));
    }

    #[test]
    fn test_stale_leases_are_pruned() {
        let defs = [LimitDefinition::rolling("rpm", 5, 60), LimitDefinition::concurrency("c", 1, 30)];
        let lease = LeaseState::new("l1", 1_000, vec![]).with_holds(&defs);
        assert_eq!(lease.expires_at_unix_ms, 61_000);
        assert!(!lease.is_stale(61_000));
        assert!(lease.is_stale(61_000 + LEASE_RETENTION_MS));

        let forever = LeaseState::new("l2", 1_000, vec![]).with_holds(&[LimitDefinition::concurrency("c", 1, 0)]);
        assert!(!forever.is_stale(i64::MAX));

        let mut leases = HashMap::from([("l1".to_string(), lease), ("l2".to_string(), forever)]);
        assert_eq!(prune_stale(&mut leases, 61_000 + LEASE_RETENTION_MS), 1);
        assert!(leases.contains_key("l2"));
    }
}
