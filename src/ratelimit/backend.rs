//! Traits at the seams between callers, transports and storage engines.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::context::CallContext;
use super::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, LimitDefinition, LimitState, ReserveRequest,
    ReserveResponse,
};
use crate::error::Result;

/// Server-side admission engine.
///
/// Denials, unknown keys and malformed requests are reported in the response
/// `error` code. An `Err` means the engine could not reach a decision and is
/// surfaced to callers as `backend_error`; engines never retry internally.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Install or update a limit; decreases are gated until usage allows.
    async fn apply_definition(&self, ctx: CallContext, def: LimitDefinition) -> Result<()>;

    /// Reserve every requirement atomically, as of `now`.
    async fn reserve(
        &self,
        ctx: CallContext,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReserveResponse>;

    /// Reconcile a lease with its actual usage and release it.
    async fn complete(&self, ctx: CallContext, req: &CompleteRequest) -> Result<CompleteResponse>;
}

/// Engines that can be seeded with persisted registry states at startup.
#[async_trait]
pub trait LoadableState: Backend {
    async fn apply_state(&self, state: LimitState) -> Result<()>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn apply_definition(&self, ctx: CallContext, def: LimitDefinition) -> Result<()> {
        (**self).apply_definition(ctx, def).await
    }

    async fn reserve(
        &self,
        ctx: CallContext,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReserveResponse> {
        (**self).reserve(ctx, req, now).await
    }

    async fn complete(&self, ctx: CallContext, req: &CompleteRequest) -> Result<CompleteResponse> {
        (**self).complete(ctx, req).await
    }
}

/// Client-facing admission API used by the scheduler, the batcher and
/// direct callers.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse>;

    async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse>;

    /// Results are returned in request order.
    async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse>;

    /// Results are returned in request order.
    async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse>;
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse> {
        (**self).reserve(ctx, req).await
    }

    async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse> {
        (**self).complete(ctx, req).await
    }

    async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse> {
        (**self).batch_reserve(ctx, req).await
    }

    async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse> {
        (**self).batch_complete(ctx, req).await
    }
}
