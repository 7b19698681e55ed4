use async_trait::async_trait;

use super::backend::Limiter;
use super::context::CallContext;
use super::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, ReserveRequest, ReserveResponse,
};
use crate::error::Result;

/// A limiter that admits everything. Used when rate limiting is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLimiter;

#[async_trait]
impl Limiter for NoopLimiter {
    async fn reserve(&self, _ctx: CallContext, _req: ReserveRequest) -> Result<ReserveResponse> {
        Ok(ReserveResponse::allowed(0))
    }

    async fn complete(&self, _ctx: CallContext, _req: CompleteRequest) -> Result<CompleteResponse> {
        Ok(CompleteResponse::ok())
    }

    async fn batch_reserve(
        &self,
        _ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse> {
        Ok(BatchReserveResponse {
            results: req.requests.iter().map(|_| ReserveResponse::allowed(0)).collect(),
        })
    }

    async fn batch_complete(
        &self,
        _ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse> {
        Ok(BatchCompleteResponse {
            results: req.requests.iter().map(|_| CompleteResponse::ok()).collect(),
        })
    }
}
