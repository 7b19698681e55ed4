//! Requirement builders for LLM calls.

use super::types::{Actual, LimitKey, Requirement};

/// Fields needed to build the limit requirements of one LLM request.
#[derive(Debug, Clone, Default)]
pub struct LlmReserveInput<'a> {
    pub tenant_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub max_output_tokens: u64,
    pub want_daily_budget: bool,
}

pub fn rpm_key(provider: &str, model: &str) -> LimitKey {
    LimitKey::new(format!("global:llm:{}:{}:rpm", provider, model))
}

pub fn tpm_key(provider: &str, model: &str) -> LimitKey {
    LimitKey::new(format!("global:llm:{}:{}:tpm", provider, model))
}

pub fn concurrency_key(provider: &str, model: &str) -> LimitKey {
    LimitKey::new(format!("global:llm:{}:{}:concurrency", provider, model))
}

pub fn daily_key(tenant_id: &str) -> LimitKey {
    LimitKey::new(format!("tenant:{}:llm:daily_tokens", tenant_id))
}

/// Conservative token estimate: one token per prompt byte.
pub fn estimate_prompt_tokens(prompt: &str) -> u64 {
    prompt.len() as u64
}

/// One request against rpm, the upper-bound token count against tpm, one
/// concurrency slot, and optionally the tenant's daily budget.
pub fn build_llm_requirements(input: &LlmReserveInput<'_>) -> Vec<Requirement> {
    let upper = estimate_prompt_tokens(input.prompt).saturating_add(input.max_output_tokens);
    let mut reqs = vec![
        Requirement::new(rpm_key(input.provider, input.model), 1),
        Requirement::new(tpm_key(input.provider, input.model), upper),
        Requirement::new(concurrency_key(input.provider, input.model), 1),
    ];
    if input.want_daily_budget {
        reqs.push(Requirement::new(daily_key(input.tenant_id), upper));
    }
    reqs
}

/// Actual token usage for the token-metered keys.
pub fn build_llm_actuals(
    tenant_id: &str,
    provider: &str,
    model: &str,
    want_daily_budget: bool,
    actual_tokens: u64,
) -> Vec<Actual> {
    let mut actuals = vec![Actual::new(tpm_key(provider, model), actual_tokens)];
    if want_daily_budget {
        actuals.push(Actual::new(daily_key(tenant_id), actual_tokens));
    }
    actuals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requirements_without_daily() {
        let reqs = build_llm_requirements(&LlmReserveInput {
            tenant_id: "t1",
            provider: "openai",
            model: "gpt-4o",
            prompt: "hello",
            max_output_tokens: 100,
            want_daily_budget: false,
        });
        assert_eq!(
            reqs,
            vec![
                Requirement::new("global:llm:openai:gpt-4o:rpm", 1),
                Requirement::new("global:llm:openai:gpt-4o:tpm", 105),
                Requirement::new("global:llm:openai:gpt-4o:concurrency", 1),
            ]
        );
    }

    #[test]
    fn test_build_requirements_with_daily() {
        let reqs = build_llm_requirements(&LlmReserveInput {
            tenant_id: "acme",
            provider: "p",
            model: "m",
            prompt: "",
            max_output_tokens: 7,
            want_daily_budget: true,
        });
        assert_eq!(reqs.len(), 4);
        assert_eq!(reqs[3], Requirement::new("tenant:acme:llm:daily_tokens", 7));
    }

    #[test]
    fn test_build_actuals() {
        let actuals = build_llm_actuals("acme", "p", "m", true, 42);
        assert_eq!(
            actuals,
            vec![
                Actual::new("global:llm:p:m:tpm", 42),
                Actual::new("tenant:acme:llm:daily_tokens", 42),
            ]
        );
        assert_eq!(build_llm_actuals("acme", "p", "m", false, 1).len(), 1);
    }

    #[test]
    fn test_estimate_counts_bytes() {
        assert_eq!(estimate_prompt_tokens("héllo"), 6);
    }
}
