use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{LedgerBackend, CODE_LIMIT, LEDGER_LIMITS};
use crate::error::{AdmissionError, Result};
use crate::ledger::ids::{
    debt_account_id, debt_transfer_id, limit_account_id, operator_account_id, rereserve_transfer_id,
    reserve_transfer_id, void_transfer_id,
};
use crate::ledger::{CreateTransferResult, LedgerError, Transfer, TransferErrors, TransferFlags};
use crate::ratelimit::context::CallContext;
use crate::ratelimit::lease::LeaseState;
use crate::ratelimit::types::{
    Actual, CompleteRequest, CompleteResponse, LimitDefinition, LimitKey, LimitKind, OveragePolicy,
};

impl LedgerBackend {
    pub(super) async fn complete_lease(&self, ctx: CallContext, req: &CompleteRequest) -> Result<CompleteResponse> {
        if req.lease_id.is_empty() {
            return Ok(CompleteResponse::failed(crate::ratelimit::types::INVALID_REQUEST));
        }
        let now = self.clock.now();

        let (lease, defs) = {
            let mut inner = self.inner.lock();
            let Some(lease) = inner.leases.remove(&req.lease_id) else {
                return Ok(CompleteResponse::ok());
            };
            let defs: HashMap<LimitKey, LimitDefinition> = lease
                .reserved_amounts
                .keys()
                .chain(req.actuals.iter().map(|a| &a.key))
                .filter_map(|key| inner.states.get(key).map(|s| (key.clone(), s.definition.clone())))
                .collect();
            (lease, defs)
        };

        let settled = async {
            self.release_concurrency(ctx, &lease, &defs).await?;
            self.reconcile_rolling(ctx, &lease, &defs, &req.actuals, now).await
        }
        .await;
        if let Err(e) = settled {
            // Every step has a deterministic id, so a retried Complete
            // skips whatever already landed.
            debug!(lease_id = %req.lease_id, error = %e, "Complete failed; lease kept for retry");
            self.inner.lock().leases.entry(req.lease_id.clone()).or_insert(lease);
            return Err(e);
        }
        trace!(lease_id = %req.lease_id, "Lease completed");
        Ok(CompleteResponse::ok())
    }

    async fn release_concurrency(
        &self,
        ctx: CallContext,
        lease: &LeaseState,
        defs: &HashMap<LimitKey, LimitDefinition>,
    ) -> Result<()> {
        let voids: Vec<Transfer> = lease
            .reserved_amounts
            .iter()
            .filter(|(key, amount)| **amount > 0 && defs.get(*key).is_some_and(|d| d.kind == LimitKind::Concurrency))
            .map(|(key, amount)| void_transfer(&lease.lease_id, key, *amount, false))
            .collect();
        if voids.is_empty() {
            return Ok(());
        }
        let errors = self.submit(ctx, voids).await?;
        check_ignorable(&errors)
    }

    async fn reconcile_rolling(
        &self,
        ctx: CallContext,
        lease: &LeaseState,
        defs: &HashMap<LimitKey, LimitDefinition>,
        actuals: &[Actual],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for actual in actuals {
            let Some(def) = defs.get(&actual.key) else { continue };
            if def.kind != LimitKind::Rolling {
                continue;
            }
            let reserved = lease.reserved(&actual.key);
            if reserved == 0 {
                continue;
            }
            let remaining = remaining_window_seconds(lease.reserved_at_unix_ms, now, def.window_seconds);
            if actual.actual_amount < reserved {
                self.reconcile_underuse(ctx, lease, def, reserved, actual.actual_amount, remaining)
                    .await?;
            } else if actual.actual_amount > reserved {
                self.reconcile_overuse(ctx, lease, def, actual.actual_amount - reserved, remaining)
                    .await?;
            }
        }
        Ok(())
    }

    /// Void the original hold and, if anything was used, hold the actual
    /// amount for the rest of the window.
    async fn reconcile_underuse(
        &self,
        ctx: CallContext,
        lease: &LeaseState,
        def: &LimitDefinition,
        reserved: u64,
        actual: u64,
        remaining: u32,
    ) -> Result<()> {
        let mut transfers = vec![void_transfer(&lease.lease_id, &def.key, reserved, actual != 0)];
        if actual != 0 {
            transfers.push(pending_transfer(&lease.lease_id, &def.key, actual, remaining));
        }
        debug!(key = %def.key, lease_id = %lease.lease_id, reserved, actual, "Reconciling underuse");
        let errors = self.submit(ctx, transfers).await?;
        check_ignorable(&errors)
    }

    /// Hold the extra usage if capacity allows; otherwise book it as debt or
    /// drop it, depending on the overage policy.
    async fn reconcile_overuse(
        &self,
        ctx: CallContext,
        lease: &LeaseState,
        def: &LimitDefinition,
        diff: u64,
        remaining: u32,
    ) -> Result<()> {
        let errors = self
            .submit(ctx, vec![pending_transfer(&lease.lease_id, &def.key, diff, remaining)])
            .await?;
        if errors.is_empty() {
            return Ok(());
        }
        if !is_overage_denied(&errors) {
            return check_ignorable(&errors);
        }
        if def.overage != OveragePolicy::Debt {
            debug!(key = %def.key, lease_id = %lease.lease_id, diff, "Overage dropped");
            return Ok(());
        }
        debug!(key = %def.key, lease_id = %lease.lease_id, diff, "Overage booked as debt");
        let errors = self.submit(ctx, vec![debt_transfer(&lease.lease_id, &def.key, diff)]).await?;
        check_ignorable(&errors)
    }
}

fn void_transfer(lease_id: &str, key: &LimitKey, amount: u64, linked: bool) -> Transfer {
    let mut flags = TransferFlags::VOID_PENDING_TRANSFER;
    if linked {
        flags = flags | TransferFlags::LINKED;
    }
    Transfer::new(
        void_transfer_id(lease_id, key),
        limit_account_id(key),
        operator_account_id(),
        amount,
        LEDGER_LIMITS,
        CODE_LIMIT,
    )
    .with_flags(flags)
    .with_pending_id(reserve_transfer_id(lease_id, key))
}

fn pending_transfer(lease_id: &str, key: &LimitKey, amount: u64, timeout: u32) -> Transfer {
    Transfer::new(
        rereserve_transfer_id(lease_id, key),
        limit_account_id(key),
        operator_account_id(),
        amount,
        LEDGER_LIMITS,
        CODE_LIMIT,
    )
    .with_flags(TransferFlags::PENDING)
    .with_timeout(timeout)
}

fn debt_transfer(lease_id: &str, key: &LimitKey, amount: u64) -> Transfer {
    Transfer::new(
        debt_transfer_id(lease_id, key),
        debt_account_id(key),
        operator_account_id(),
        amount,
        LEDGER_LIMITS,
        CODE_LIMIT,
    )
}

/// Results that mean a retried step already took effect or has nothing left
/// to release.
fn is_ignorable(result: CreateTransferResult) -> bool {
    matches!(
        result,
        CreateTransferResult::Exists
            | CreateTransferResult::PendingTransferExpired
            | CreateTransferResult::PendingTransferAlreadyVoided
            | CreateTransferResult::PendingTransferAlreadyPosted
            | CreateTransferResult::PendingTransferNotFound
    )
}

/// `IdAlreadyFailed` is a retry of an extra hold that was already refused.
fn is_overage_denied(errors: &TransferErrors) -> bool {
    errors.values().any(|r| {
        matches!(
            r,
            CreateTransferResult::ExceedsCredits
                | CreateTransferResult::ExceedsDebits
                | CreateTransferResult::IdAlreadyFailed
        )
    })
}

/// A batch is fine when every failure is ignorable, or a linked event that
/// failed because of one. Only linked failures means the real cause was lost.
fn check_ignorable(errors: &TransferErrors) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let mut saw_ignorable = false;
    for &result in errors.values() {
        if result == CreateTransferResult::LinkedEventFailed {
            continue;
        }
        if !is_ignorable(result) {
            return Err(AdmissionError::Ledger(LedgerError::Transfer(result)));
        }
        saw_ignorable = true;
    }
    if saw_ignorable {
        Ok(())
    } else {
        Err(AdmissionError::Ledger(LedgerError::Transfer(
            CreateTransferResult::LinkedEventFailed,
        )))
    }
}

/// Whole seconds left in a window that opened at `reserved_at_unix_ms`; at least 1.
fn remaining_window_seconds(reserved_at_unix_ms: i64, now: DateTime<Utc>, window_seconds: u64) -> u32 {
    if window_seconds == 0 {
        return 1;
    }
    let elapsed = (now.timestamp_millis() - reserved_at_unix_ms).max(0) / 1000;
    let remaining = (window_seconds as i64).saturating_sub(elapsed).max(1);
    u32::try_from(remaining).unwrap_or(u32::MAX)
}
