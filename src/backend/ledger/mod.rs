//! Durable admission engine on top of a double-entry ledger.
//!
//! Each limit key owns an account whose balance is its capacity. A
//! reservation is a linked chain of pending transfers from the limit
//! accounts to the operator account, so the ledger enforces multi-key
//! atomicity and capacity bounds. Completion voids, shrinks or tops up
//! those transfers. All ids are deterministic, which makes retries
//! idempotent across restarts.

mod apply;
mod complete;
mod decrease;
mod deny;
mod reserve;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use self::deny::DenyTracker;
use crate::error::{AdmissionError, Result};
use crate::ledger::{
    Account, LedgerClient, LedgerError, Submitter, SubmitterConfig, SubmitterHandle, Transfer,
    TransferErrors,
};
use crate::ratelimit::backend::{Backend, LoadableState};
use crate::ratelimit::clock::Clock;
use crate::ratelimit::context::CallContext;
use crate::ratelimit::lease::LeaseState;
use crate::ratelimit::registry::Registry;
use crate::ratelimit::retry::RetryPolicy;
use crate::ratelimit::types::{
    CompleteRequest, CompleteResponse, LimitDefinition, LimitKey, LimitState, ReserveRequest,
    ReserveResponse,
};

const LEDGER_LIMITS: u32 = 1;
const CODE_LIMIT: u16 = 1;

#[derive(Debug, Clone)]
pub struct LedgerBackendConfig {
    pub submitter: SubmitterConfig,
    pub retry: RetryPolicy,
    /// Where applied decreases are saved; `None` keeps them in memory.
    pub registry_path: Option<PathBuf>,
    pub decrease_interval: Duration,
}

impl Default for LedgerBackendConfig {
    fn default() -> Self {
        Self {
            submitter: SubmitterConfig::default(),
            retry: RetryPolicy::default(),
            registry_path: None,
            decrease_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Inner {
    states: HashMap<LimitKey, LimitState>,
    leases: HashMap<String, LeaseState>,
}

pub struct LedgerBackend {
    client: Arc<dyn LedgerClient>,
    submitter: Submitter,
    handle: SubmitterHandle,
    registry: Arc<Registry>,
    registry_path: Option<PathBuf>,
    retry: RetryPolicy,
    denials: DenyTracker,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerBackend {
    /// Start the submitter and the decrease sweep, then provision every
    /// state already in `registry`.
    pub async fn start(
        client: Arc<dyn LedgerClient>,
        registry: Arc<Registry>,
        config: LedgerBackendConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let submitter = Submitter::spawn(client.clone(), config.submitter.clone());
        let handle = submitter.handle();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let backend = Arc::new(Self {
            client,
            submitter,
            handle,
            registry: registry.clone(),
            registry_path: config.registry_path,
            retry: config.retry,
            denials: DenyTracker::default(),
            clock,
            inner: Mutex::new(Inner::default()),
            shutdown,
            sweep: Mutex::new(None),
        });

        let sweep = backend.spawn_decrease_sweep(config.decrease_interval, shutdown_rx);
        *backend.sweep.lock() = Some(sweep);

        let states = registry.list();
        let loaded = states.len();
        for state in states {
            if let Err(e) = backend.apply_state(state).await {
                backend.shutdown().await;
                return Err(e);
            }
        }
        info!(states = loaded, "Ledger backend started");
        Ok(backend)
    }

    /// Stop the sweep and flush the submitter.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let sweep = self.sweep.lock().take();
        if let Some(sweep) = sweep {
            if let Err(e) = sweep.await {
                warn!(error = %e, "Decrease sweep task failed");
            }
        }
        self.submitter.shutdown().await;
    }

    pub fn state(&self, key: &LimitKey) -> Option<LimitState> {
        self.inner.lock().states.get(key).cloned()
    }

    /// Overage recorded against `key` under the debt policy.
    pub async fn debt_for_key(&self, ctx: CallContext, key: &LimitKey) -> Result<u64> {
        let account = self.lookup_account(ctx, crate::ledger::ids::debt_account_id(key)).await?;
        Ok(account.debits_posted)
    }

    /// Posted balance and pending debits of the limit account for `key`.
    pub async fn limit_account(&self, ctx: CallContext, key: &LimitKey) -> Result<Account> {
        self.lookup_account(ctx, crate::ledger::ids::limit_account_id(key)).await
    }

    async fn submit(&self, ctx: CallContext, transfers: Vec<Transfer>) -> Result<TransferErrors> {
        self.handle.submit(&ctx, transfers).await.map_err(ledger_error)
    }

    async fn lookup_account(&self, ctx: CallContext, id: u128) -> Result<Account> {
        let lookup = async {
            let mut accounts = self.client.lookup_accounts(vec![id]).await.map_err(ledger_error)?;
            if accounts.is_empty() {
                return Err(AdmissionError::Ledger(LedgerError::AccountNotFound(id)));
            }
            Ok(accounts.swap_remove(0))
        };
        ctx.run(lookup).await
    }
}

fn ledger_error(e: LedgerError) -> AdmissionError {
    match e {
        LedgerError::Timeout => AdmissionError::DeadlineExceeded,
        other => AdmissionError::Ledger(other),
    }
}

/// First result other than `Exists`, as an error.
fn first_transfer_error(errors: &TransferErrors) -> Result<()> {
    match errors
        .values()
        .find(|r| **r != crate::ledger::CreateTransferResult::Exists)
    {
        Some(result) => Err(AdmissionError::Ledger(LedgerError::Transfer(*result))),
        None => Ok(()),
    }
}

#[async_trait]
impl Backend for LedgerBackend {
    async fn apply_definition(&self, ctx: CallContext, def: LimitDefinition) -> Result<()> {
        self.apply_limit(ctx, def).await
    }

    async fn reserve(
        &self,
        ctx: CallContext,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReserveResponse> {
        self.reserve_lease(ctx, req, now).await
    }

    async fn complete(&self, ctx: CallContext, req: &CompleteRequest) -> Result<CompleteResponse> {
        self.complete_lease(ctx, req).await
    }
}

#[async_trait]
impl LoadableState for LedgerBackend {
    async fn apply_state(&self, state: LimitState) -> Result<()> {
        let ctx = CallContext::background();
        self.ensure_accounts(ctx, &state.definition).await?;
        self.ensure_capacity(ctx, &state.definition).await?;
        self.inner.lock().states.insert(state.key().clone(), state);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::ratelimit::types::Requirement;

    #[tokio::test]
    async fn test_start_loads_registry_states() {
        let clock = Arc::new(crate::ratelimit::clock::ManualClock::new(Utc::now()));
        let ledger = Arc::new(crate::ledger::LocalLedger::in_memory(clock.clone()));
        let registry = Arc::new(Registry::new());
        registry.put(LimitState::active(LimitDefinition::rolling("k1", 3, 10)));

        let h = restart(clock, ledger, registry).await;
        let key = LimitKey::from("k1");
        assert_eq!(h.backend.state(&key).unwrap().definition.capacity, 3);
        let account = h.backend.limit_account(CallContext::background(), &key).await.unwrap();
        assert_eq!(account.balance(), 3);

        let resp = h
            .backend
            .reserve(
                CallContext::background(),
                &ReserveRequest::new("L1", vec![Requirement::new("k1", 3)]),
                h.clock.now(),
            )
            .await
            .unwrap();
        assert!(resp.allowed);
        h.backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_keeps_capacity_without_duplicate_top_up() {
        let h = harness().await;
        h.backend
            .apply_definition(CallContext::background(), LimitDefinition::rolling("k1", 5, 10))
            .await
            .unwrap();
        h.registry.put(LimitState::active(LimitDefinition::rolling("k1", 5, 10)));
        h.backend.shutdown().await;

        let h = restart(h.clock, h.ledger, h.registry).await;
        let account = h
            .backend
            .limit_account(CallContext::background(), &LimitKey::from("k1"))
            .await
            .unwrap();
        assert_eq!(account.balance(), 5);
        h.backend.shutdown().await;
    }
}
