use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{first_transfer_error, LedgerBackend, CODE_LIMIT, LEDGER_LIMITS};
use crate::error::Result;
use crate::ledger::ids::{decrease_transfer_id, limit_account_id, operator_account_id};
use crate::ledger::Transfer;
use crate::ratelimit::context::CallContext;
use crate::ratelimit::lease::prune_stale;
use crate::ratelimit::types::{LimitKey, LimitState, LimitStatus};

impl LedgerBackend {
    pub(super) fn spawn_decrease_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let backend = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(backend) = backend.upgrade() else { return };
                        backend.apply_pending_decreases().await;
                        backend.prune_stale_leases();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Ledger decrease sweep stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Forget leases whose holds all lapsed long ago without a Complete.
    pub fn prune_stale_leases(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let pruned = prune_stale(&mut self.inner.lock().leases, now_ms);
        if pruned > 0 {
            debug!(pruned, "Pruned stale leases");
        }
        pruned
    }

    /// Try every decreasing key once; returns how many were applied.
    pub async fn apply_pending_decreases(&self) -> usize {
        let pending: Vec<LimitState> = self
            .inner
            .lock()
            .states
            .values()
            .filter(|s| s.is_decreasing())
            .cloned()
            .collect();

        let mut applied = 0;
        for state in pending {
            let key = state.key().clone();
            match self.apply_decrease(state).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Capacity decrease attempt failed"),
            }
        }
        applied
    }

    pub async fn try_apply_decrease(&self, key: &LimitKey) -> Result<bool> {
        let state = self.inner.lock().states.get(key).cloned();
        match state {
            Some(state) => self.apply_decrease(state).await,
            None => Ok(false),
        }
    }

    /// Post the capacity reduction once enough balance is free of pending
    /// holds, then flip the state active and persist it.
    async fn apply_decrease(&self, state: LimitState) -> Result<bool> {
        if state.status != LimitStatus::Decreasing {
            return Ok(false);
        }
        let key = state.key().clone();
        let target = state.pending_decrease_to;
        if target == 0 || target >= state.definition.capacity {
            return Ok(false);
        }

        let ctx = CallContext::background();
        let account = self.lookup_account(ctx, limit_account_id(&key)).await?;
        let balance = account.balance();
        if balance > target {
            // Measured from the balance so a reduction that landed but was
            // never acknowledged is not applied twice.
            let delta = balance - target;
            let available = account.available();
            if available < delta {
                trace!(key = %key, available, delta, "Decrease still blocked");
                return Ok(false);
            }
            let transfer = Transfer::new(
                decrease_transfer_id(&key, target, account.debits_posted),
                limit_account_id(&key),
                operator_account_id(),
                delta,
                LEDGER_LIMITS,
                CODE_LIMIT,
            );
            let errors = self.submit(ctx, vec![transfer]).await?;
            first_transfer_error(&errors)?;
        }

        let mut def = state.definition;
        def.capacity = target;
        let applied = LimitState::active(def);
        {
            let mut inner = self.inner.lock();
            // A newer definition may have replaced the one we started from.
            if inner.states.get(&key).map(|s| (s.status, s.pending_decrease_to)) != Some((LimitStatus::Decreasing, target))
            {
                return Ok(false);
            }
            inner.states.insert(key.clone(), applied.clone());
        }
        info!(key = %key, capacity = target, "Capacity decrease applied");

        self.registry.put(applied);
        if let Some(path) = &self.registry_path {
            self.registry.save(path)?;
        }
        Ok(true)
    }
}
