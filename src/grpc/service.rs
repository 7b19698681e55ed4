//! Admission service implementation.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

use super::proto::admission_server::Admission;
use super::wire::{
    AdminPutResponse, BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest,
    BatchReserveResponse, CompleteRequest, CompleteResponse, GetLimitRequest, GetLimitResponse,
    LimitDefinition, ListLimitsRequest, ListLimitsResponse, ReserveRequest, ReserveResponse,
};
use crate::api::{AdmissionApi, ApiError};
use crate::ratelimit::backend::Backend;
use crate::ratelimit::context::CallContext;

/// Serves [`AdmissionApi`] over gRPC.
pub struct AdmissionService<B: ?Sized> {
    api: Arc<AdmissionApi<B>>,
    default_timeout: Option<Duration>,
}

impl<B: Backend + ?Sized> AdmissionService<B> {
    pub fn new(api: Arc<AdmissionApi<B>>) -> Self {
        Self {
            api,
            default_timeout: None,
        }
    }

    /// Deadline applied when the caller sends no `grpc-timeout`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn context<T>(&self, request: &Request<T>) -> CallContext {
        call_context(request, self.default_timeout)
    }
}

impl From<ApiError> for Status {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Invalid => Status::invalid_argument(err.code()),
            ApiError::NotFound => Status::not_found(err.code()),
            ApiError::Backend(ref e) => {
                debug!(error = %e, "Admin call failed in backend");
                Status::internal(err.code())
            }
        }
    }
}

/// The caller's `grpc-timeout`, or `fallback`, as a [`CallContext`].
pub fn call_context<T>(request: &Request<T>, fallback: Option<Duration>) -> CallContext {
    request
        .metadata()
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .or(fallback)
        .map(CallContext::with_timeout)
        .unwrap_or_default()
}

fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(n.saturating_mul(3600)),
        "M" => Duration::from_secs(n.saturating_mul(60)),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    })
}

#[tonic::async_trait]
impl<B: Backend + ?Sized + 'static> Admission for AdmissionService<B> {
    #[instrument(skip(self, request), fields(lease_id = %request.get_ref().lease_id))]
    async fn reserve(&self, request: Request<ReserveRequest>) -> Result<Response<ReserveResponse>, Status> {
        let ctx = self.context(&request);
        let resp = self.api.reserve(ctx, request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    #[instrument(skip(self, request), fields(size = request.get_ref().requests.len()))]
    async fn batch_reserve(
        &self,
        request: Request<BatchReserveRequest>,
    ) -> Result<Response<BatchReserveResponse>, Status> {
        let ctx = self.context(&request);
        let resp = self.api.batch_reserve(ctx, request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    #[instrument(skip(self, request), fields(lease_id = %request.get_ref().lease_id))]
    async fn complete(&self, request: Request<CompleteRequest>) -> Result<Response<CompleteResponse>, Status> {
        let ctx = self.context(&request);
        let resp = self.api.complete(ctx, request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    #[instrument(skip(self, request), fields(size = request.get_ref().requests.len()))]
    async fn batch_complete(
        &self,
        request: Request<BatchCompleteRequest>,
    ) -> Result<Response<BatchCompleteResponse>, Status> {
        let ctx = self.context(&request);
        let resp = self.api.batch_complete(ctx, request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn put_limit(&self, request: Request<LimitDefinition>) -> Result<Response<AdminPutResponse>, Status> {
        let ctx = self.context(&request);
        let resp = self.api.put_limit(ctx, request.into_inner()).await?;
        Ok(Response::new(resp))
    }

    async fn list_limits(
        &self,
        _request: Request<ListLimitsRequest>,
    ) -> Result<Response<ListLimitsResponse>, Status> {
        Ok(Response::new(ListLimitsResponse {
            limits: self.api.list_limits(),
        }))
    }

    async fn get_limit(&self, request: Request<GetLimitRequest>) -> Result<Response<GetLimitResponse>, Status> {
        let limit = self.api.get_limit(&request.get_ref().key)?;
        Ok(Response::new(GetLimitResponse { limit }))
    }
}
