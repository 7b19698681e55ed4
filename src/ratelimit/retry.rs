//! Retry-after hints for denied reservations.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::types::{LimitDefinition, LimitKind};

/// Retry hint for a key pending a capacity decrease.
pub const DECREASE_RETRY_MS: u64 = 10_000;

const MEMORY_ROLLING_MIN_MS: u64 = 100;
const MEMORY_ROLLING_MAX_MS: u64 = 5_000;
const MEMORY_CONCURRENCY_MIN_MS: u64 = 50;
const MEMORY_CONCURRENCY_MAX_MS: u64 = 2_000;

/// Fixed heuristic used by the in-memory engine.
///
/// Concurrency keys retry after their timeout clamped to [50, 2000] ms.
/// Rolling keys retry after 10% of the window clamped to [100, 5000] ms.
pub fn memory_retry_after_ms(def: &LimitDefinition) -> u64 {
    match def.kind {
        LimitKind::Concurrency => {
            let timeout_ms = def.timeout_seconds.saturating_mul(1000);
            let timeout_ms = if timeout_ms == 0 { MEMORY_CONCURRENCY_MAX_MS } else { timeout_ms };
            timeout_ms.clamp(MEMORY_CONCURRENCY_MIN_MS, MEMORY_CONCURRENCY_MAX_MS)
        }
        LimitKind::Rolling => {
            let base = def.window_seconds.saturating_mul(1000) / 10;
            base.clamp(MEMORY_ROLLING_MIN_MS, MEMORY_ROLLING_MAX_MS)
        }
    }
}

/// Uniform jitter in `[0, max_ms]`.
pub fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}

/// Exponential backoff for concurrency denials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
}

/// Window-scaled backoff for rolling denials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter_ms: u64,
    pub window_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPolicy {
    pub fixed_ms: u64,
}

/// Retry-after configuration for the ledger engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_concurrency")]
    pub concurrency: BackoffPolicy,
    #[serde(default = "default_rolling")]
    pub rolling: RollingPolicy,
    #[serde(default = "default_decreasing")]
    pub decreasing: FixedPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            rolling: default_rolling(),
            decreasing: default_decreasing(),
        }
    }
}

fn default_concurrency() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 50,
        max_ms: 2_000,
        factor: 2.0,
        jitter_ms: 25,
    }
}

fn default_rolling() -> RollingPolicy {
    RollingPolicy {
        base_ms: 100,
        max_ms: 5_000,
        factor: 1.5,
        jitter_ms: 50,
        window_fraction: 0.1,
    }
}

fn default_decreasing() -> FixedPolicy {
    FixedPolicy {
        fixed_ms: DECREASE_RETRY_MS,
    }
}

impl RetryPolicy {
    /// Hint for the `streak`-th consecutive denial of `def`.
    ///
    /// `jitter` receives the jitter bound and returns a value in `[0, bound]`.
    pub fn retry_after_ms<J>(&self, def: &LimitDefinition, streak: u32, jitter: J) -> u64
    where
        J: FnOnce(u64) -> u64,
    {
        let streak = streak.max(1) as i32;
        match def.kind {
            LimitKind::Concurrency => {
                let p = &self.concurrency;
                let mut cap = p.max_ms;
                if def.timeout_seconds > 0 {
                    cap = cap.min(def.timeout_seconds.saturating_mul(1000));
                }
                let raw = p.base_ms as f64 * p.factor.powi(streak);
                let delay = clamp_ms(raw, p.base_ms, cap);
                delay + bounded(jitter, p.jitter_ms)
            }
            LimitKind::Rolling => {
                let p = &self.rolling;
                let scaled = (def.window_seconds.saturating_mul(1000) as f64 * p.window_fraction) as u64;
                let base = p.base_ms.max(scaled);
                let raw = base as f64 * p.factor.powi(streak);
                let delay = clamp_ms(raw, base, p.max_ms);
                delay + bounded(jitter, p.jitter_ms)
            }
        }
    }
}

fn bounded<J: FnOnce(u64) -> u64>(jitter: J, max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    jitter(max).min(max)
}

/// Clamp to `[min, max]`; a `max` below `min` yields `min`.
fn clamp_ms(raw: f64, min: u64, max: u64) -> u64 {
    let raw = if raw.is_finite() { raw.max(0.0) as u64 } else { u64::MAX };
    raw.min(max).max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_heuristic_concurrency() {
        assert_eq!(memory_retry_after_ms(&LimitDefinition::concurrency("c", 1, 300)), 2_000);
        assert_eq!(memory_retry_after_ms(&LimitDefinition::concurrency("c", 1, 1)), 1_000);
    }

    #[test]
    fn test_memory_heuristic_rolling() {
        assert_eq!(memory_retry_after_ms(&LimitDefinition::rolling("r", 1, 10)), 1_000);
        assert_eq!(memory_retry_after_ms(&LimitDefinition::rolling("r", 1, 1)), 100);
        assert_eq!(memory_retry_after_ms(&LimitDefinition::rolling("r", 1, 3600)), 5_000);
    }

    #[test]
    fn test_concurrency_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let def = LimitDefinition::concurrency("c", 1, 300);
        assert_eq!(policy.retry_after_ms(&def, 1, |_| 0), 100);
        assert_eq!(policy.retry_after_ms(&def, 2, |_| 0), 200);
        assert_eq!(policy.retry_after_ms(&def, 20, |_| 0), 2_000);
    }

    #[test]
    fn test_concurrency_cap_respects_timeout() {
        let policy = RetryPolicy::default();
        let def = LimitDefinition::concurrency("c", 1, 1);
        assert_eq!(policy.retry_after_ms(&def, 10, |_| 0), 1_000);
    }

    #[test]
    fn test_rolling_backoff_scales_with_window() {
        let policy = RetryPolicy::default();
        let def = LimitDefinition::rolling("r", 1, 10);
        // base = max(100, 10% of 10s) = 1000, first denial = 1000 * 1.5
        assert_eq!(policy.retry_after_ms(&def, 1, |_| 0), 1_500);
        assert_eq!(policy.retry_after_ms(&def, 30, |_| 0), 5_000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let def = LimitDefinition::concurrency("c", 1, 300);
        assert_eq!(policy.retry_after_ms(&def, 1, |max| max * 10), 125);
        for _ in 0..100 {
            assert!(jitter_ms(25) <= 25);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[test]
    fn test_zero_streak_counts_as_first() {
        let policy = RetryPolicy::default();
        let def = LimitDefinition::concurrency("c", 1, 300);
        assert_eq!(
            policy.retry_after_ms(&def, 0, |_| 0),
            policy.retry_after_ms(&def, 1, |_| 0)
        );
    }
}
