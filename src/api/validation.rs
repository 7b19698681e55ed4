//! Request shape rules applied before anything reaches a backend.

use super::ApiError;
use crate::ratelimit::registry::Registry;
use crate::ratelimit::retry::DECREASE_RETRY_MS;
use crate::ratelimit::types::{
    limit_decreasing, unknown_limit_key, CompleteRequest, LimitDefinition, LimitKey, LimitKind,
    LimitStatus, ReserveRequest, ReserveResponse,
};

pub const MAX_REQUIREMENTS_PER_RESERVE: usize = 32;
pub const MAX_BATCH_REQUESTS: usize = 256;

/// What the boundary decided about a reserve before calling the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveCheck {
    Invalid,
    /// Answered without the backend: unknown or decreasing key.
    Denied(ReserveResponse),
    Ok,
}

pub fn check_reserve(registry: &Registry, req: &ReserveRequest) -> ReserveCheck {
    if req.lease_id.is_empty() {
        return ReserveCheck::Invalid;
    }
    if req.requirements.is_empty() || req.requirements.len() > MAX_REQUIREMENTS_PER_RESERVE {
        return ReserveCheck::Invalid;
    }
    for r in &req.requirements {
        if r.key.is_empty() || r.amount == 0 {
            return ReserveCheck::Invalid;
        }
        match registry.get(&r.key) {
            None => return ReserveCheck::Denied(ReserveResponse::denied_with(0, unknown_limit_key(&r.key))),
            Some(state) if state.status == LimitStatus::Decreasing => {
                return ReserveCheck::Denied(ReserveResponse::denied_with(
                    DECREASE_RETRY_MS,
                    limit_decreasing(&r.key),
                ))
            }
            Some(_) => {}
        }
    }
    ReserveCheck::Ok
}

pub fn check_complete(req: &CompleteRequest) -> Result<(), ApiError> {
    if req.lease_id.is_empty() {
        return Err(ApiError::Invalid);
    }
    Ok(())
}

pub fn check_batch_len(len: usize) -> Result<(), ApiError> {
    if len == 0 || len > MAX_BATCH_REQUESTS {
        return Err(ApiError::Invalid);
    }
    Ok(())
}

/// Trim text fields, then enforce the per-kind field combinations.
pub fn normalize_definition(mut def: LimitDefinition) -> Result<LimitDefinition, ApiError> {
    def.key = LimitKey::new(def.key.as_str().trim());
    def.unit = def.unit.trim().to_string();
    def.description = def.description.trim().to_string();

    if def.key.is_empty() || def.capacity == 0 {
        return Err(ApiError::Invalid);
    }
    let shape_ok = match def.kind {
        LimitKind::Rolling => def.window_seconds > 0 && def.timeout_seconds == 0,
        LimitKind::Concurrency => def.timeout_seconds > 0 && def.window_seconds == 0,
    };
    if !shape_ok {
        return Err(ApiError::Invalid);
    }
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::types::{LimitState, Requirement};

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.put(LimitState::active(LimitDefinition::rolling("k1", 10, 60)));
        registry.put(LimitState::decreasing(LimitDefinition::rolling("k2", 10, 60), 5));
        registry
    }

    #[test]
    fn test_reserve_shape_rules() {
        let registry = registry();
        let ok = ReserveRequest::new("L1", vec![Requirement::new("k1", 1)]);
        assert_eq!(check_reserve(&registry, &ok), ReserveCheck::Ok);

        let no_lease = ReserveRequest::new("", vec![Requirement::new("k1", 1)]);
        assert_eq!(check_reserve(&registry, &no_lease), ReserveCheck::Invalid);

        let empty = ReserveRequest::new("L1", vec![]);
        assert_eq!(check_reserve(&registry, &empty), ReserveCheck::Invalid);

        let too_many = ReserveRequest::new("L1", vec![Requirement::new("k1", 1); MAX_REQUIREMENTS_PER_RESERVE + 1]);
        assert_eq!(check_reserve(&registry, &too_many), ReserveCheck::Invalid);

        let zero = ReserveRequest::new("L1", vec![Requirement::new("k1", 0)]);
        assert_eq!(check_reserve(&registry, &zero), ReserveCheck::Invalid);

        let blank_key = ReserveRequest::new("L1", vec![Requirement::new("", 1)]);
        assert_eq!(check_reserve(&registry, &blank_key), ReserveCheck::Invalid);
    }

    #[test]
    fn test_reserve_registry_denials() {
        let registry = registry();
        let unknown = ReserveRequest::new("L1", vec![Requirement::new("nope", 1)]);
        match check_reserve(&registry, &unknown) {
            ReserveCheck::Denied(resp) => {
                assert!(!resp.allowed);
                assert_eq!(resp.error, "unknown_limit_key:nope");
                assert_eq!(resp.retry_after_ms, 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let decreasing = ReserveRequest::new("L1", vec![Requirement::new("k1", 1), Requirement::new("k2", 1)]);
        match check_reserve(&registry, &decreasing) {
            ReserveCheck::Denied(resp) => {
                assert_eq!(resp.error, "limit_decreasing:k2");
                assert_eq!(resp.retry_after_ms, DECREASE_RETRY_MS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_batch_bounds() {
        assert!(check_batch_len(0).is_err());
        assert!(check_batch_len(1).is_ok());
        assert!(check_batch_len(MAX_BATCH_REQUESTS).is_ok());
        assert!(check_batch_len(MAX_BATCH_REQUESTS + 1).is_err());
    }

    #[test]
    fn test_definition_rules() {
        let mut def = LimitDefinition::rolling("  k1 ", 5, 60);
        def.unit = " tokens ".into();
        let def = normalize_definition(def).unwrap();
        assert_eq!(def.key.as_str(), "k1");
        assert_eq!(def.unit, "tokens");

        assert!(normalize_definition(LimitDefinition::rolling("   ", 5, 60)).is_err());
        assert!(normalize_definition(LimitDefinition::rolling("k", 0, 60)).is_err());
        assert!(normalize_definition(LimitDefinition::rolling("k", 5, 0)).is_err());
        assert!(normalize_definition(LimitDefinition::concurrency("k", 5, 0)).is_err());

        let mut mixed = LimitDefinition::rolling("k", 5, 60);
        mixed.timeout_seconds = 30;
        assert!(normalize_definition(mixed).is_err());

        let mut mixed = LimitDefinition::concurrency("k", 5, 30);
        mixed.window_seconds = 60;
        assert!(normalize_definition(mixed).is_err());

        assert!(normalize_definition(LimitDefinition::concurrency("k", 5, 30)).is_ok());
    }
}
