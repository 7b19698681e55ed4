//! [`Limiter`] backed by a remote admission server.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;
use tracing::debug;

use super::proto::admission_client::AdmissionClient;
use crate::error::{AdmissionError, Result};
use crate::ratelimit::backend::Limiter;
use crate::ratelimit::context::CallContext;
use crate::ratelimit::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, ReserveRequest, ReserveResponse,
};

/// Talks to `admissiond` over gRPC. The connection is established lazily
/// on the first call.
#[derive(Clone)]
pub struct RemoteLimiter {
    client: AdmissionClient<Channel>,
    timeout: Option<Duration>,
}

impl RemoteLimiter {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url.into();
        let mut endpoint = Endpoint::from_shared(base_url.trim_end_matches('/').to_string())?;
        if let Some(timeout) = timeout {
            endpoint = endpoint.timeout(timeout);
        }
        debug!(url = %base_url, "Remote limiter configured");
        Ok(Self {
            client: AdmissionClient::new(endpoint.connect_lazy()),
            timeout,
        })
    }

    /// The tighter of the caller's deadline and the configured timeout.
    fn request<T>(&self, ctx: &CallContext, message: T) -> (CallContext, Request<T>) {
        let ctx = match self.timeout {
            Some(timeout) => ctx.earliest(CallContext::with_timeout(timeout)),
            None => *ctx,
        };
        let mut request = Request::new(message);
        if let Some(deadline) = ctx.deadline() {
            request.set_timeout(deadline.saturating_duration_since(Instant::now()));
        }
        (ctx, request)
    }
}

#[async_trait]
impl Limiter for RemoteLimiter {
    async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse> {
        let (ctx, request) = self.request(&ctx, req);
        let mut client = self.client.clone();
        ctx.run(async move { Ok::<_, AdmissionError>(client.reserve(request).await?.into_inner()) }).await
    }

    async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse> {
        let (ctx, request) = self.request(&ctx, req);
        let mut client = self.client.clone();
        ctx.run(async move { Ok::<_, AdmissionError>(client.complete(request).await?.into_inner()) }).await
    }

    async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse> {
        let (ctx, request) = self.request(&ctx, req);
        let mut client = self.client.clone();
        ctx.run(async move { Ok::<_, AdmissionError>(client.batch_reserve(request).await?.into_inner()) }).await
    }

    async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse> {
        let (ctx, request) = self.request(&ctx, req);
        let mut client = self.client.clone();
        ctx.run(async move { Ok::<_, AdmissionError>(client.batch_complete(request).await?.into_inner()) }).await
    }
}
