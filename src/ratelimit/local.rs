//! In-process [`Limiter`] over any [`Backend`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::backend::{Backend, Limiter, LoadableState};
use super::clock::{Clock, SystemClock};
use super::context::CallContext;
use super::registry::Registry;
use super::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, LimitState, ReserveRequest, ReserveResponse, BACKEND_ERROR,
};
use crate::backend::MemoryBackend;
use crate::error::Result;

/// Calls the backend directly, stamping reservations with `clock`.
pub struct LocalLimiter<B: ?Sized> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
}

impl<B: Backend + ?Sized> LocalLimiter<B> {
    pub fn new(backend: Arc<B>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl LocalLimiter<MemoryBackend> {
    /// An embedded memory engine seeded with `states`.
    pub async fn memory_from_states(states: Vec<LimitState>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        for state in states {
            backend.apply_state(state).await?;
        }
        Ok(Self::new(backend, clock))
    }

    /// An embedded memory engine seeded from a registry file.
    pub async fn memory_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let registry = Registry::new();
        registry.load(path)?;
        Self::memory_from_states(registry.list()).await
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Limiter for LocalLimiter<B> {
    async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse> {
        self.backend.reserve(ctx, &req, self.clock.now()).await
    }

    async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse> {
        self.backend.complete(ctx, &req).await
    }

    async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse> {
        let mut results = Vec::with_capacity(req.requests.len());
        for item in &req.requests {
            match self.backend.reserve(ctx, item, self.clock.now()).await {
                Ok(resp) => results.push(resp),
                Err(e) => {
                    warn!(lease_id = %item.lease_id, error = %e, "Batch reserve item failed");
                    results.push(ReserveResponse::backend_error());
                }
            }
        }
        Ok(BatchReserveResponse { results })
    }

    async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse> {
        let mut results = Vec::with_capacity(req.requests.len());
        for item in &req.requests {
            match self.backend.complete(ctx, item).await {
                Ok(resp) => results.push(resp),
                Err(e) => {
                    warn!(lease_id = %item.lease_id, error = %e, "Batch complete item failed");
                    results.push(CompleteResponse::failed(BACKEND_ERROR));
                }
            }
        }
        Ok(BatchCompleteResponse { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::types::{LimitDefinition, Requirement, INVALID_REQUEST};

    #[tokio::test]
    async fn test_memory_limiter_from_states_allows_reserve() {
        let limiter = LocalLimiter::memory_from_states(vec![LimitState::active(LimitDefinition::concurrency(
            "global:llm:test:model:concurrency",
            1,
            1,
        ))])
        .await
        .unwrap();

        let resp = limiter
            .reserve(
                CallContext::background(),
                ReserveRequest::new("lease-1", vec![Requirement::new("global:llm:test:model:concurrency", 1)]),
            )
            .await
            .unwrap();
        assert!(resp.allowed);
    }

    #[tokio::test]
    async fn test_batch_reserve_items_are_independent() {
        let limiter = LocalLimiter::memory_from_states(vec![LimitState::active(LimitDefinition::rolling("k1", 1, 10))])
            .await
            .unwrap();

        let batch = BatchReserveRequest {
            requests: vec![
                ReserveRequest::new("L-A", vec![Requirement::new("k1", 1)]),
                ReserveRequest::new("", vec![Requirement::new("k1", 1)]),
                ReserveRequest::new("L-B", vec![Requirement::new("k1", 1)]),
            ],
        };
        let resp = limiter.batch_reserve(CallContext::background(), batch).await.unwrap();
        assert_eq!(resp.results.len(), 3);
        assert!(resp.results[0].allowed);
        assert_eq!(resp.results[1].error, INVALID_REQUEST);
        assert!(!resp.results[2].allowed);
        assert!(resp.results[2].retry_after_ms > 0);
    }

    #[tokio::test]
    async fn test_memory_limiter_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = LocalLimiter::memory_from_file(dir.path().join("absent.json")).await.unwrap();
        let resp = limiter
            .reserve(CallContext::background(), ReserveRequest::new("L1", vec![Requirement::new("k", 1)]))
            .await
            .unwrap();
        assert_eq!(resp.error, "unknown_limit_key:k");
    }
}
