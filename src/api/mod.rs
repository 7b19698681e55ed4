//! Transport-agnostic admission and admin handlers.
//!
//! Every request is validated here before a backend sees it. Transports
//! decode their wire format, call [`AdmissionApi`] and map [`ApiError`] to
//! their own status codes.

pub mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::validation::{check_batch_len, check_complete, check_reserve, normalize_definition, ReserveCheck};
use crate::error::AdmissionError;
use crate::ratelimit::backend::Backend;
use crate::ratelimit::clock::Clock;
use crate::ratelimit::context::CallContext;
use crate::ratelimit::registry::Registry;
use crate::ratelimit::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, LimitDefinition, LimitKey, LimitState, LimitStatus,
    ReserveRequest, ReserveResponse, BACKEND_ERROR, INVALID_REQUEST, NOT_FOUND,
};

/// Boundary failures. Denials are not errors and travel in the response.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid_request")]
    Invalid,

    #[error("not_found")]
    NotFound,

    #[error("backend_error: {0}")]
    Backend(#[from] AdmissionError),
}

impl ApiError {
    /// Wire code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Invalid => INVALID_REQUEST,
            ApiError::NotFound => NOT_FOUND,
            ApiError::Backend(_) => BACKEND_ERROR,
        }
    }
}

/// Result of an admin put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminPutResponse {
    pub ok: bool,
    pub status: LimitStatus,
}

pub struct AdmissionApi<B: ?Sized> {
    registry: Arc<Registry>,
    backend: Arc<B>,
    registry_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl<B: Backend + ?Sized> AdmissionApi<B> {
    pub fn new(registry: Arc<Registry>, backend: Arc<B>, registry_path: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            backend,
            registry_path,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn reserve(&self, ctx: CallContext, req: ReserveRequest) -> Result<ReserveResponse, ApiError> {
        match check_reserve(&self.registry, &req) {
            ReserveCheck::Invalid => Err(ApiError::Invalid),
            ReserveCheck::Denied(resp) => Ok(resp),
            ReserveCheck::Ok => match self.backend.reserve(ctx, &req, self.clock.now()).await {
                Ok(resp) => Ok(resp),
                Err(e) => {
                    warn!(lease_id = %req.lease_id, error = %e, "Reserve failed in backend");
                    Ok(ReserveResponse::backend_error())
                }
            },
        }
    }

    /// Each item is validated and answered on its own. One timestamp covers
    /// the whole batch.
    pub async fn batch_reserve(
        &self,
        ctx: CallContext,
        req: BatchReserveRequest,
    ) -> Result<BatchReserveResponse, ApiError> {
        check_batch_len(req.requests.len())?;
        let now = self.clock.now();
        let mut results = Vec::with_capacity(req.requests.len());
        for item in &req.requests {
            let result = match check_reserve(&self.registry, item) {
                ReserveCheck::Invalid => ReserveResponse::invalid(),
                ReserveCheck::Denied(resp) => resp,
                ReserveCheck::Ok => match self.backend.reserve(ctx, item, now).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(lease_id = %item.lease_id, error = %e, "Batch reserve item failed in backend");
                        ReserveResponse::backend_error()
                    }
                },
            };
            results.push(result);
        }
        debug!(size = results.len(), "Batch reserve handled");
        Ok(BatchReserveResponse { results })
    }

    pub async fn complete(&self, ctx: CallContext, req: CompleteRequest) -> Result<CompleteResponse, ApiError> {
        check_complete(&req)?;
        match self.backend.complete(ctx, &req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!(lease_id = %req.lease_id, error = %e, "Complete failed in backend");
                Ok(CompleteResponse::failed(BACKEND_ERROR))
            }
        }
    }

    pub async fn batch_complete(
        &self,
        ctx: CallContext,
        req: BatchCompleteRequest,
    ) -> Result<BatchCompleteResponse, ApiError> {
        check_batch_len(req.requests.len())?;
        let mut results = Vec::with_capacity(req.requests.len());
        for item in &req.requests {
            let result = if check_complete(item).is_err() {
                CompleteResponse::failed(INVALID_REQUEST)
            } else {
                match self.backend.complete(ctx, item).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(lease_id = %item.lease_id, error = %e, "Batch complete item failed in backend");
                        CompleteResponse::failed(BACKEND_ERROR)
                    }
                }
            };
            results.push(result);
        }
        Ok(BatchCompleteResponse { results })
    }

    /// Validate, apply to the backend, then record and persist the state the
    /// registry's transition rule yields.
    pub async fn put_limit(&self, ctx: CallContext, def: LimitDefinition) -> Result<AdminPutResponse, ApiError> {
        let def = normalize_definition(def)?;
        let state = self.registry.next_state(&def);
        self.backend.apply_definition(ctx, def).await?;
        let status = state.status;
        info!(key = %state.key(), status = %status, capacity = state.definition.capacity, "Limit definition stored");
        self.registry.put(state);
        if let Some(path) = &self.registry_path {
            self.registry.save(path)?;
        }
        Ok(AdminPutResponse { ok: true, status })
    }

    pub fn list_limits(&self) -> Vec<LimitState> {
        self.registry.list()
    }

    pub fn get_limit(&self, key: &str) -> Result<LimitState, ApiError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ApiError::NotFound);
        }
        self.registry.get(&LimitKey::new(key)).ok_or(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::types::Requirement;

    fn api() -> AdmissionApi<MemoryBackend> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        AdmissionApi::new(Arc::new(Registry::new()), backend, None, clock)
    }

    #[tokio::test]
    async fn test_put_then_reserve() {
        let api = api();
        let ctx = CallContext::background();
        let put = api.put_limit(ctx, LimitDefinition::rolling(" k1 ", 1, 60)).await.unwrap();
        assert!(put.ok);
        assert_eq!(put.status, LimitStatus::Active);

        let first = api
            .reserve(ctx, ReserveRequest::new("L1", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap();
        assert!(first.allowed);
        let second = api
            .reserve(ctx, ReserveRequest::new("L2", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap();
        assert!(!second.allowed);
    }

    #[tokio::test]
    async fn test_reserve_invalid_is_rejected() {
        let api = api();
        let err = api
            .reserve(CallContext::background(), ReserveRequest::new("", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_reserve_unknown_key_is_denial() {
        let api = api();
        let resp = api
            .reserve(CallContext::background(), ReserveRequest::new("L1", vec![Requirement::new("missing", 1)]))
            .await
            .unwrap();
        assert!(!resp.allowed);
        assert_eq!(resp.error, "unknown_limit_key:missing");
    }

    #[tokio::test]
    async fn test_decrease_reports_status_and_denies() {
        let api = api();
        let ctx = CallContext::background();
        api.put_limit(ctx, LimitDefinition::rolling("k1", 5, 60)).await.unwrap();
        let put = api.put_limit(ctx, LimitDefinition::rolling("k1", 2, 60)).await.unwrap();
        assert_eq!(put.status, LimitStatus::Decreasing);

        let resp = api
            .reserve(ctx, ReserveRequest::new("L1", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap();
        assert_eq!(resp.error, "limit_decreasing:k1");
        assert_eq!(resp.retry_after_ms, 10_000);
    }

    #[tokio::test]
    async fn test_batch_items_are_independent() {
        let api = api();
        let ctx = CallContext::background();
        api.put_limit(ctx, LimitDefinition::rolling("k1", 1, 60)).await.unwrap();

        let resp = api
            .batch_reserve(
                ctx,
                BatchReserveRequest {
                    requests: vec![
                        ReserveRequest::new("L-A", vec![Requirement::new("k1", 1)]),
                        ReserveRequest::new("", vec![Requirement::new("k1", 1)]),
                        ReserveRequest::new("L-B", vec![Requirement::new("k1", 1)]),
                    ],
                },
            )
            .await
            .unwrap();
        assert!(resp.results[0].allowed);
        assert_eq!(resp.results[1].error, INVALID_REQUEST);
        assert!(!resp.results[2].allowed);
        assert!(resp.results[2].error.is_empty());

        let empty = api.batch_reserve(ctx, BatchReserveRequest::default()).await;
        assert!(matches!(empty, Err(ApiError::Invalid)));
    }

    #[tokio::test]
    async fn test_batch_complete_flags_empty_lease() {
        let api = api();
        let resp = api
            .batch_complete(
                CallContext::background(),
                BatchCompleteRequest {
                    requests: vec![CompleteRequest::new("L1", vec![]), CompleteRequest::new("", vec![])],
                },
            )
            .await
            .unwrap();
        assert!(resp.results[0].ok);
        assert_eq!(resp.results[1].error, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_put_limit_rejects_bad_shape_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let api = AdmissionApi::new(Arc::new(Registry::new()), backend, Some(path.clone()), clock);
        let ctx = CallContext::background();

        let err = api.put_limit(ctx, LimitDefinition::rolling("k", 1, 0)).await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid));

        api.put_limit(ctx, LimitDefinition::concurrency("k", 2, 30)).await.unwrap();
        let reloaded = Registry::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.get(&LimitKey::from("k")).unwrap().definition.capacity, 2);
    }

    #[tokio::test]
    async fn test_get_and_list() {
        let api = api();
        let ctx = CallContext::background();
        api.put_limit(ctx, LimitDefinition::rolling("b", 1, 60)).await.unwrap();
        api.put_limit(ctx, LimitDefinition::rolling("a", 1, 60)).await.unwrap();

        let keys: Vec<String> = api.list_limits().iter().map(|s| s.key().as_str().to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(api.get_limit(" a ").unwrap().definition.capacity, 1);
        assert!(matches!(api.get_limit("zzz"), Err(ApiError::NotFound)));
        assert!(matches!(api.get_limit(""), Err(ApiError::NotFound)));
    }
}
