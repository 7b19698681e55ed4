//! Message types carried by the `admission.v1.Admission` service.

use serde::{Deserialize, Serialize};

pub use crate::api::AdminPutResponse;
pub use crate::ratelimit::types::{
    BatchCompleteRequest, BatchCompleteResponse, BatchReserveRequest, BatchReserveResponse,
    CompleteRequest, CompleteResponse, LimitDefinition, LimitState, ReserveRequest,
    ReserveResponse,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListLimitsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListLimitsResponse {
    pub limits: Vec<LimitState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLimitRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLimitResponse {
    pub limit: LimitState,
}
