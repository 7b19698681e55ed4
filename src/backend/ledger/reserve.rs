use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{LedgerBackend, CODE_LIMIT, LEDGER_LIMITS};
use crate::error::{AdmissionError, Result};
use crate::ledger::ids::{limit_account_id, operator_account_id, reserve_transfer_id};
use crate::ledger::{CreateTransferResult, LedgerError, Transfer, TransferErrors, TransferFlags};
use crate::ratelimit::context::CallContext;
use crate::ratelimit::lease::{merge_by_key, LeaseState};
use crate::ratelimit::retry::jitter_ms;
use crate::ratelimit::types::{
    limit_decreasing, unknown_limit_key, LimitDefinition, LimitKind, Requirement, ReserveRequest,
    ReserveResponse,
};

enum Decision {
    /// `replayed` when an earlier attempt already committed the chain.
    Allow { replayed: bool },
    Deny(u64),
}

const NANOS_PER_MILLI: u64 = 1_000_000;

impl LedgerBackend {
    pub(super) async fn reserve_lease(
        &self,
        ctx: CallContext,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReserveResponse> {
        if req.lease_id.is_empty() || req.requirements.is_empty() {
            return Ok(ReserveResponse::invalid());
        }

        let merged = merge_by_key(&req.requirements);
        let defs = {
            let inner = self.inner.lock();
            if let Some(lease) = inner.leases.get(&req.lease_id) {
                if lease.matches(&req.requirements) {
                    return Ok(ReserveResponse::allowed(lease.reserved_at_unix_ms));
                }
                debug!(lease_id = %req.lease_id, "Lease reused with different requirements");
                return Ok(ReserveResponse::invalid());
            }
            for r in &req.requirements {
                if inner.states.get(&r.key).is_some_and(|s| s.is_decreasing()) {
                    debug!(key = %r.key, lease_id = %req.lease_id, "Reserve denied: limit decreasing");
                    return Ok(ReserveResponse::denied_with(
                        self.retry.decreasing.fixed_ms,
                        limit_decreasing(&r.key),
                    ));
                }
            }
            let mut defs = Vec::with_capacity(merged.len());
            for r in &merged {
                match inner.states.get(&r.key) {
                    Some(state) => defs.push(state.definition.clone()),
                    None => {
                        debug!(key = %r.key, lease_id = %req.lease_id, "Reserve denied: unknown key");
                        return Ok(ReserveResponse::denied_with(0, unknown_limit_key(&r.key)));
                    }
                }
            }
            defs
        };

        let chain = reserve_chain(&req.lease_id, &merged, &defs);
        let errors = self.submit(ctx, chain).await?;
        match self.evaluate(&merged, &defs, &errors)? {
            Decision::Deny(retry_after_ms) => {
                debug!(lease_id = %req.lease_id, retry_after_ms, "Reserve denied: capacity");
                Ok(ReserveResponse::denied(retry_after_ms))
            }
            Decision::Allow { replayed } => {
                let reserved_at = if replayed {
                    self.committed_at(ctx, &req.lease_id, &merged)
                        .await
                        .unwrap_or_else(|| now.timestamp_millis())
                } else {
                    now.timestamp_millis()
                };
                let lease =
                    LeaseState::new(req.lease_id.clone(), reserved_at, req.requirements.clone()).with_holds(&defs);
                self.inner.lock().leases.insert(req.lease_id.clone(), lease);
                for r in &merged {
                    self.denials.reset(&r.key);
                }
                trace!(lease_id = %req.lease_id, keys = merged.len(), "Reserve allowed");
                Ok(ReserveResponse::allowed(reserved_at))
            }
        }
    }

    /// When the earliest hold of an already committed chain was created, in
    /// unix milliseconds.
    async fn committed_at(&self, ctx: CallContext, lease_id: &str, merged: &[Requirement]) -> Option<i64> {
        let ids = merged.iter().map(|r| reserve_transfer_id(lease_id, &r.key)).collect();
        let lookup = async { self.client.lookup_transfers(ids).await.map_err(super::ledger_error) };
        let found = match ctx.run(lookup).await {
            Ok(found) => found,
            Err(e) => {
                debug!(lease_id = %lease_id, error = %e, "Could not look up replayed reservation");
                return None;
            }
        };
        let earliest = found.iter().map(|t| t.timestamp).filter(|ts| *ts > 0).min()?;
        i64::try_from(earliest / NANOS_PER_MILLI).ok()
    }

    /// Turn the chain's failed events into a decision.
    ///
    /// A chain that reports `Exists` was committed by an earlier attempt.
    fn evaluate(&self, merged: &[Requirement], defs: &[LimitDefinition], errors: &TransferErrors) -> Result<Decision> {
        if errors.is_empty() {
            return Ok(Decision::Allow { replayed: false });
        }

        let mut denied = false;
        let mut max_retry = 0;
        let mut exists = false;
        let mut unexpected = None;
        for (&index, &result) in errors {
            match result {
                CreateTransferResult::ExceedsCredits
                | CreateTransferResult::ExceedsDebits
                | CreateTransferResult::IdAlreadyFailed => {
                    denied = true;
                    if let (Some(r), Some(def)) = (merged.get(index), defs.get(index)) {
                        let streak = self.denials.increment(&r.key);
                        max_retry = max_retry.max(self.retry.retry_after_ms(def, streak, jitter_ms));
                    }
                }
                CreateTransferResult::Exists => exists = true,
                CreateTransferResult::LinkedEventFailed => {}
                other => unexpected = unexpected.or(Some(other)),
            }
        }

        if denied {
            return Ok(Decision::Deny(max_retry));
        }
        match unexpected {
            Some(result) => Err(AdmissionError::Ledger(LedgerError::Transfer(result))),
            None if exists => Ok(Decision::Allow { replayed: true }),
            None => Err(AdmissionError::Ledger(LedgerError::Transfer(
                CreateTransferResult::LinkedEventFailed,
            ))),
        }
    }
}

/// One pending transfer per key, linked so the chain commits atomically.
fn reserve_chain(lease_id: &str, merged: &[Requirement], defs: &[LimitDefinition]) -> Vec<Transfer> {
    let last = merged.len().saturating_sub(1);
    merged
        .iter()
        .zip(defs)
        .enumerate()
        .map(|(i, (r, def))| {
            let mut flags = TransferFlags::PENDING;
            if i < last {
                flags = flags | TransferFlags::LINKED;
            }
            Transfer::new(
                reserve_transfer_id(lease_id, &r.key),
                limit_account_id(&r.key),
                operator_account_id(),
                r.amount,
                LEDGER_LIMITS,
                CODE_LIMIT,
            )
            .with_flags(flags)
            .with_timeout(hold_seconds(def))
        })
        .collect()
}

fn hold_seconds(def: &LimitDefinition) -> u32 {
    let seconds = match def.kind {
        LimitKind::Rolling => def.window_seconds,
        LimitKind::Concurrency => def.timeout_seconds,
    };
    u32::try_from(seconds).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{harness, restart};
    use crate::ratelimit::backend::Backend;
    use crate::ratelimit::clock::Clock;
    use crate::ratelimit::context::CallContext;
    use crate::ratelimit::types::{
        LimitDefinition, LimitKey, Requirement, ReserveRequest, INVALID_REQUEST,
    };

    fn req(lease: &str, reqs: &[(&str, u64)]) -> ReserveRequest {
        ReserveRequest::new(lease, reqs.iter().map(|(k, a)| Requirement::new(*k, *a)).collect())
    }

    #[tokio::test]
    async fn test_rolling_capacity_denies_third() {
        let h = harness().await;
        let ctx = CallContext::background();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 2, 10)).await.unwrap();

        let now = h.clock.now();
        assert!(h.backend.reserve(ctx, &req("L1", &[("k1", 1)]), now).await.unwrap().allowed);
        assert!(h.backend.reserve(ctx, &req("L2", &[("k1", 1)]), now).await.unwrap().allowed);
        let third = h.backend.reserve(ctx, &req("L3", &[("k1", 1)]), now).await.unwrap();
        assert!(!third.allowed);
        assert!(third.retry_after_ms > 0);
        assert!(third.error.is_empty());
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_rolling_window_expiry_frees_capacity() {
        let h = harness().await;
        let ctx = CallContext::background();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 1, 10)).await.unwrap();

        assert!(h.backend.reserve(ctx, &req("L1", &[("k1", 1)]), h.clock.now()).await.unwrap().allowed);
        assert!(!h.backend.reserve(ctx, &req("L2", &[("k1", 1)]), h.clock.now()).await.unwrap().allowed);

        h.clock.advance(chrono::Duration::seconds(11));
        assert!(h.backend.reserve(ctx, &req("L3", &[("k1", 1)]), h.clock.now()).await.unwrap().allowed);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_idempotent_reserve_counts_once() {
        let h = harness().await;
        let ctx = CallContext::background();
        let key = LimitKey::from("k1");
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 5, 10)).await.unwrap();

        let first = h.backend.reserve(ctx, &req("L1", &[("k1", 2)]), h.clock.now()).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        let second = h.backend.reserve(ctx, &req("L1", &[("k1", 2)]), h.clock.now()).await.unwrap();
        assert!(first.allowed && second.allowed);
        assert_eq!(first.reserved_at_unix_ms, second.reserved_at_unix_ms);
        assert_eq!(h.backend.limit_account(ctx, &key).await.unwrap().available(), 3);

        let mismatch = h.backend.reserve(ctx, &req("L1", &[("k1", 3)]), h.clock.now()).await.unwrap();
        assert_eq!(mismatch.error, INVALID_REQUEST);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_reserve_after_restart_is_idempotent() {
        let h = harness().await;
        let ctx = CallContext::background();
        let key = LimitKey::from("k1");
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 5, 10)).await.unwrap();
        h.registry.put(crate::ratelimit::types::LimitState::active(LimitDefinition::rolling("k1", 5, 10)));
        let first = h.backend.reserve(ctx, &req("L1", &[("k1", 2)]), h.clock.now()).await.unwrap();
        assert!(first.allowed);
        h.backend.shutdown().await;

        // The lease table is gone; the ledger still knows the chain.
        let h = restart(h.clock, h.ledger, h.registry).await;
        h.clock.advance(chrono::Duration::seconds(2));
        let again = h.backend.reserve(ctx, &req("L1", &[("k1", 2)]), h.clock.now()).await.unwrap();
        assert!(again.allowed);
        assert!((again.reserved_at_unix_ms - first.reserved_at_unix_ms).abs() <= 1);
        assert_eq!(h.backend.limit_account(ctx, &key).await.unwrap().available(), 3);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_multi_key_deny_is_atomic() {
        let h = harness().await;
        let ctx = CallContext::background();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("a", 5, 10)).await.unwrap();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("b", 1, 10)).await.unwrap();
        assert!(h.backend.reserve(ctx, &req("L0", &[("b", 1)]), h.clock.now()).await.unwrap().allowed);

        let resp = h.backend.reserve(ctx, &req("L1", &[("a", 1), ("b", 1)]), h.clock.now()).await.unwrap();
        assert!(!resp.allowed);
        let a = h.backend.limit_account(ctx, &LimitKey::from("a")).await.unwrap();
        assert_eq!(a.debits_pending, 0);

        assert!(h.backend.reserve(ctx, &req("L2", &[("a", 1)]), h.clock.now()).await.unwrap().allowed);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_repeated_key_is_merged() {
        let h = harness().await;
        let ctx = CallContext::background();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 3, 10)).await.unwrap();

        let resp = h.backend.reserve(ctx, &req("L1", &[("k1", 2), ("k1", 2)]), h.clock.now()).await.unwrap();
        assert!(!resp.allowed);
        let resp = h.backend.reserve(ctx, &req("L2", &[("k1", 1), ("k1", 2)]), h.clock.now()).await.unwrap();
        assert!(resp.allowed);
        let account = h.backend.limit_account(ctx, &LimitKey::from("k1")).await.unwrap();
        assert_eq!(account.available(), 0);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_and_unknown() {
        let h = harness().await;
        let ctx = CallContext::background();
        h.backend.apply_definition(ctx, LimitDefinition::rolling("k1", 3, 10)).await.unwrap();

        let resp = h.backend.reserve(ctx, &req("", &[("k1", 1)]), h.clock.now()).await.unwrap();
        assert_eq!(resp.error, INVALID_REQUEST);
        let resp = h.backend.reserve(ctx, &req("L1", &[]), h.clock.now()).await.unwrap();
        assert_eq!(resp.error, INVALID_REQUEST);
        let resp = h.backend.reserve(ctx, &req("L1", &[("k1", 1), ("nope", 1)]), h.clock.now()).await.unwrap();
        assert!(!resp.allowed);
        assert_eq!(resp.error, "unknown_limit_key:nope");
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_deny_streak_backs_off_and_resets() {
        let h = harness().await;
        let ctx = CallContext::background();
        let key = LimitKey::from("c1");
        h.backend.apply_definition(ctx, LimitDefinition::concurrency("c1", 1, 300)).await.unwrap();

        assert!(h.backend.reserve(ctx, &req("C1", &[("c1", 1)]), h.clock.now()).await.unwrap().allowed);
        let d1 = h.backend.reserve(ctx, &req("C2", &[("c1", 1)]), h.clock.now()).await.unwrap();
        let d2 = h.backend.reserve(ctx, &req("C3", &[("c1", 1)]), h.clock.now()).await.unwrap();
        assert_eq!((d1.retry_after_ms, d2.retry_after_ms), (100, 200));
        assert_eq!(h.backend.denials.streak(&key), 2);

        h.backend
            .complete(ctx, &crate::ratelimit::types::CompleteRequest::new("C1", vec![]))
            .await
            .unwrap();
        assert!(h.backend.reserve(ctx, &req("C4", &[("c1", 1)]), h.clock.now()).await.unwrap().allowed);
        assert_eq!(h.backend.denials.streak(&key), 0);
        let d3 = h.backend.reserve(ctx, &req("C5", &[("c1", 1)]), h.clock.now()).await.unwrap();
        assert_eq!(d3.retry_after_ms, 100);
        h.backend.shutdown().await;
    }
}
