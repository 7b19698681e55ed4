//! Single-process authoritative admission engine.
//!
//! All state sits behind one mutex. Every operation is a short point
//! update, so admission decisions are trivially sequential.

mod concurrency;
mod rolling;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use self::concurrency::ConcurrencyLimit;
use self::rolling::RollingLimit;
use crate::error::Result;
use crate::ratelimit::backend::{Backend, LoadableState};
use crate::ratelimit::clock::{Clock, SystemClock};
use crate::ratelimit::context::CallContext;
use crate::ratelimit::lease::{merge_by_key, prune_stale, LeaseState};
use crate::ratelimit::registry::{next_state, Registry};
use crate::ratelimit::retry::{memory_retry_after_ms, DECREASE_RETRY_MS};
use crate::ratelimit::types::{
    limit_decreasing, unknown_limit_key, CompleteRequest, CompleteResponse, LimitDefinition,
    LimitKey, LimitKind, LimitState, LimitStatus, OveragePolicy, ReserveRequest, ReserveResponse,
};

/// Point-in-time copy of the engine's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub rolling: HashMap<LimitKey, RollingSnapshot>,
    pub concurrency: HashMap<LimitKey, ConcurrencySnapshot>,
    pub debt: HashMap<LimitKey, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingSnapshot {
    pub capacity: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySnapshot {
    pub capacity: u64,
    pub holds: usize,
}

#[derive(Default)]
struct Inner {
    defs: HashMap<LimitKey, LimitDefinition>,
    states: HashMap<LimitKey, LimitState>,
    rolling: HashMap<LimitKey, RollingLimit>,
    concurrency: HashMap<LimitKey, ConcurrencyLimit>,
    debt: HashMap<LimitKey, u64>,
    leases: HashMap<String, LeaseState>,
    registry: Option<(Arc<Registry>, Option<PathBuf>)>,
    next_seq: u64,
}

/// In-memory backend with rolling and concurrency trackers per key.
pub struct MemoryBackend {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Send applied decreases to `registry`, saving to `path` when given.
    pub fn attach_registry(&self, registry: Arc<Registry>, path: Option<PathBuf>) {
        self.inner.lock().registry = Some((registry, path));
    }

    pub fn debt_for_key(&self, key: &LimitKey) -> u64 {
        self.inner.lock().debt.get(key).copied().unwrap_or(0)
    }

    pub fn state(&self, key: &LimitKey) -> Option<LimitState> {
        self.inner.lock().states.get(key).cloned()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock();
        MemorySnapshot {
            rolling: inner
                .rolling
                .iter()
                .map(|(k, l)| {
                    (
                        k.clone(),
                        RollingSnapshot {
                            capacity: l.capacity,
                            used: l.used(),
                        },
                    )
                })
                .collect(),
            concurrency: inner
                .concurrency
                .iter()
                .map(|(k, l)| {
                    (
                        k.clone(),
                        ConcurrencySnapshot {
                            capacity: l.capacity,
                            holds: l.holds(),
                        },
                    )
                })
                .collect(),
            debt: inner.debt.clone(),
        }
    }

    /// Apply a pending decrease for `key` if current usage leaves room.
    ///
    /// Returns whether the decrease was applied. Never triggered by
    /// Reserve or Complete; see [`MemoryBackend::spawn_decrease_sweep`].
    pub fn try_apply_decrease(&self, key: &LimitKey) -> Result<bool> {
        let now = self.clock.now();
        let (applied, registry) = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.states.get(key).cloned() else {
                return Ok(false);
            };
            if state.status != LimitStatus::Decreasing {
                return Ok(false);
            }
            let current = state.definition.capacity;
            let target = state.pending_decrease_to;
            if target == 0 || target >= current {
                return Ok(false);
            }

            inner.evict_key(key, now);
            let available = inner.available(key, state.definition.kind);
            if available < current - target {
                trace!(key = %key, available, delta = current - target, "Decrease still blocked");
                return Ok(false);
            }

            let mut def = state.definition;
            def.capacity = target;
            let applied = LimitState::active(def.clone());
            inner.update_capacity(&def);
            inner.defs.insert(key.clone(), def);
            inner.states.insert(key.clone(), applied.clone());
            (applied, inner.registry.clone())
        };

        info!(key = %key, capacity = applied.definition.capacity, "Capacity decrease applied");
        if let Some((registry, path)) = registry {
            registry.put(applied);
            if let Some(path) = path {
                registry.save(&path)?;
            }
        }
        Ok(true)
    }

    /// Try every key currently in decreasing status; returns how many applied.
    pub fn apply_pending_decreases(&self) -> usize {
        let keys: Vec<LimitKey> = {
            let inner = self.inner.lock();
            inner
                .states
                .values()
                .filter(|s| s.is_decreasing())
                .map(|s| s.key().clone())
                .collect()
        };
        let mut applied = 0;
        for key in keys {
            match self.try_apply_decrease(&key) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to persist applied decrease"),
            }
        }
        applied
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

    /// Run [`MemoryBackend::apply_pending_decreases`] and
    /// [`MemoryBackend::prune_stale_leases`] on a timer until
    /// `shutdown` flips to true.
    pub fn spawn_decrease_sweep(
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
                        backend.apply_pending_decreases();
                        backend.prune_stale_leases();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Memory decrease sweep stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Inner {
    fn ensure_trackers(&mut self, def: &LimitDefinition) {
        match def.kind {
            LimitKind::Rolling => {
                self.rolling
                    .entry(def.key.clone())
                    .or_insert_with(|| RollingLimit::new(def.capacity));
            }
            LimitKind::Concurrency => {
                self.concurrency
                    .entry(def.key.clone())
                    .or_insert_with(|| ConcurrencyLimit::new(def.capacity));
            }
        }
    }

    fn update_capacity(&mut self, def: &LimitDefinition) {
        match def.kind {
            LimitKind::Rolling => {
                if let Some(limit) = self.rolling.get_mut(&def.key) {
                    limit.capacity = def.capacity;
                }
            }
            LimitKind::Concurrency => {
                if let Some(limit) = self.concurrency.get_mut(&def.key) {
                    limit.capacity = def.capacity;
                }
            }
        }
    }

    fn install(&mut self, state: LimitState) {
        let def = state.definition.clone();
        self.ensure_trackers(&def);
        self.update_capacity(&def);
        self.defs.insert(def.key.clone(), def);
        self.states.insert(state.key().clone(), state);
    }

    fn evict_key(&mut self, key: &LimitKey, now: DateTime<Utc>) {
        if let Some(limit) = self.rolling.get_mut(key) {
            limit.evict_expired(now);
        }
        if let Some(limit) = self.concurrency.get_mut(key) {
            limit.evict_expired(now);
        }
    }

    fn available(&self, key: &LimitKey, kind: LimitKind) -> u64 {
        match kind {
            LimitKind::Rolling => self.rolling.get(key).map_or(0, |l| l.available()),
            LimitKind::Concurrency => self.concurrency.get(key).map_or(0, |l| l.available()),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn apply_definition(&self, _ctx: CallContext, def: LimitDefinition) -> Result<()> {
        let mut inner = self.inner.lock();
        let prev = inner.states.get(&def.key).cloned();
        let state = next_state(prev.as_ref(), &def);
        match state.status {
            LimitStatus::Active => {
                info!(key = %def.key, kind = %def.kind, capacity = def.capacity, "Limit applied");
                inner.install(state);
            }
            LimitStatus::Decreasing => {
                info!(
                    key = %def.key,
                    capacity = state.definition.capacity,
                    target = state.pending_decrease_to,
                    "Limit decrease pending"
                );
                inner.states.insert(def.key.clone(), state);
            }
        }
        Ok(())
    }

    async fn reserve(
        &self,
        _ctx: CallContext,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReserveResponse> {
        let mut inner = self.inner.lock();

        if req.lease_id.is_empty() || req.requirements.is_empty() {
            return Ok(ReserveResponse::invalid());
        }
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
                return Ok(ReserveResponse::denied_with(DECREASE_RETRY_MS, limit_decreasing(&r.key)));
            }
        }
        for r in &req.requirements {
            if !inner.defs.contains_key(&r.key) {
                debug!(key = %r.key, lease_id = %req.lease_id, "Reserve denied: unknown key");
                return Ok(ReserveResponse::denied_with(0, unknown_limit_key(&r.key)));
            }
        }

        let merged = merge_by_key(&req.requirements);
        for r in &merged {
            inner.evict_key(&r.key, now);
        }

        let mut max_retry = 0;
        for r in &merged {
            let Some(def) = inner.defs.get(&r.key) else { continue };
            let exceeded = match def.kind {
                LimitKind::Rolling => inner.rolling.get(&r.key).map_or(true, |l| l.would_exceed(r.amount)),
                LimitKind::Concurrency => inner.concurrency.get(&r.key).map_or(true, |l| l.is_full()),
            };
            if exceeded {
                max_retry = max_retry.max(memory_retry_after_ms(def));
            }
        }
        if max_retry > 0 {
            debug!(lease_id = %req.lease_id, retry_after_ms = max_retry, "Reserve denied: capacity");
            return Ok(ReserveResponse::denied(max_retry));
        }

        let seq = inner.next_seq();
        for r in &merged {
            let Some(def) = inner.defs.get(&r.key).cloned() else { continue };
            let expires_at = now + chrono::Duration::from_std(def.hold_duration()).unwrap_or(chrono::Duration::zero());
            match def.kind {
                LimitKind::Rolling => {
                    if let Some(limit) = inner.rolling.get_mut(&r.key) {
                        limit.add(seq, &req.lease_id, r.amount, expires_at);
                    }
                }
                LimitKind::Concurrency => {
                    if let Some(limit) = inner.concurrency.get_mut(&r.key) {
                        limit.add(seq, &req.lease_id, expires_at);
                    }
                }
            }
        }

        let reserved_at = now.timestamp_millis();
        let defs: Vec<LimitDefinition> = merged.iter().filter_map(|r| inner.defs.get(&r.key).cloned()).collect();
        inner.leases.insert(
            req.lease_id.clone(),
            LeaseState::new(req.lease_id.clone(), reserved_at, req.requirements.clone()).with_holds(&defs),
        );
        trace!(lease_id = %req.lease_id, keys = merged.len(), "Reserve allowed");
        Ok(ReserveResponse::allowed(reserved_at))
    }

    async fn complete(&self, _ctx: CallContext, req: &CompleteRequest) -> Result<CompleteResponse> {
        let mut inner = self.inner.lock();

        let Some(lease) = inner.leases.remove(&req.lease_id) else {
            return Ok(CompleteResponse::ok());
        };

        for key in lease.reserved_amounts.keys() {
            let is_concurrency = inner
                .defs
                .get(key)
                .is_some_and(|d| d.kind == LimitKind::Concurrency);
            if is_concurrency {
                if let Some(limit) = inner.concurrency.get_mut(key) {
                    limit.release(&req.lease_id);
                }
            }
        }

        for actual in &req.actuals {
            let Some(def) = inner.defs.get(&actual.key) else { continue };
            if def.kind != LimitKind::Rolling {
                continue;
            }
            let overage = def.overage;
            let reserved = lease.reserved(&actual.key);
            if actual.actual_amount < reserved {
                if let Some(limit) = inner.rolling.get_mut(&actual.key) {
                    limit.reduce(&req.lease_id, actual.actual_amount);
                }
            } else if actual.actual_amount > reserved && overage == OveragePolicy::Debt {
                let extra = actual.actual_amount - reserved;
                let debt = inner.debt.entry(actual.key.clone()).or_insert(0);
                *debt = debt.saturating_add(extra);
                debug!(key = %actual.key, lease_id = %req.lease_id, extra, "Overage recorded as debt");
            }
        }

        trace!(lease_id = %req.lease_id, "Lease completed");
        Ok(CompleteResponse::ok())
    }
}

#[async_trait]
impl LoadableState for MemoryBackend {
    async fn apply_state(&self, state: LimitState) -> Result<()> {
        self.inner.lock().install(state);
        Ok(())
    }
}
