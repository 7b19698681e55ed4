//! Limit definitions, requests and responses shared by every limiter.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error code for malformed requests.
pub const INVALID_REQUEST: &str = "invalid_request";
/// Error code for storage or transport failures.
pub const BACKEND_ERROR: &str = "backend_error";
/// Error code returned by the admin get operation for an absent key.
pub const NOT_FOUND: &str = "not_found";

const UNKNOWN_LIMIT_KEY_PREFIX: &str = "unknown_limit_key:";
const LIMIT_DECREASING_PREFIX: &str = "limit_decreasing:";

/// Error code for a reservation against an undefined key.
pub fn unknown_limit_key(key: &LimitKey) -> String {
    format!("{}{}", UNKNOWN_LIMIT_KEY_PREFIX, key)
}

/// Error code for a reservation against a key with a pending decrease.
pub fn limit_decreasing(key: &LimitKey) -> String {
    format!("{}{}", LIMIT_DECREASING_PREFIX, key)
}

/// Identifies the resource being limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitKey(String);

impl LimitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LimitKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for LimitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Limiter semantics for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LimitKind {
    /// Capacity consumed for a fixed window from reservation time.
    Rolling,
    /// Capacity representing simultaneously in-flight units.
    Concurrency,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Rolling => "rolling",
            LimitKind::Concurrency => "concurrency",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rolling" => Ok(LimitKind::Rolling),
            "concurrency" => Ok(LimitKind::Concurrency),
            other => Err(format!("unknown limit kind: {:?}", other)),
        }
    }
}

impl TryFrom<String> for LimitKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LimitKind> for String {
    fn from(kind: LimitKind) -> Self {
        kind.as_str().to_string()
    }
}

/// What happens when actual usage exceeds the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OveragePolicy {
    /// Usage beyond the reservation is rejected.
    Deny,
    /// Usage beyond the reservation is recorded as unenforced debt.
    #[default]
    Debt,
}

impl OveragePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OveragePolicy::Deny => "deny",
            OveragePolicy::Debt => "debt",
        }
    }
}

impl fmt::Display for OveragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OveragePolicy {
    type Err = String;

    /// An empty policy selects the default (`debt`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "debt" => Ok(OveragePolicy::Debt),
            "deny" => Ok(OveragePolicy::Deny),
            other => Err(format!("unknown overage policy: {:?}", other)),
        }
    }
}

impl TryFrom<String> for OveragePolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OveragePolicy> for String {
    fn from(policy: OveragePolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// Whether a limit accepts reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitStatus {
    #[default]
    Active,
    /// A lower capacity was requested but is not yet safe to apply.
    Decreasing,
}

impl LimitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitStatus::Active => "active",
            LimitStatus::Decreasing => "decreasing",
        }
    }
}

impl fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side definition of a limit.
///
/// Exactly one of `window_seconds` and `timeout_seconds` is nonzero, selected
/// by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub key: LimitKey,
    pub kind: LimitKind,
    pub capacity: u64,
    #[serde(default)]
    pub window_seconds: u64,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub overage: OveragePolicy,
}

impl LimitDefinition {
    /// A rolling-window limit with the default overage policy.
    pub fn rolling(key: impl Into<LimitKey>, capacity: u64, window_seconds: u64) -> Self {
        Self {
            key: key.into(),
            kind: LimitKind::Rolling,
            capacity,
            window_seconds,
            timeout_seconds: 0,
            unit: String::new(),
            description: String::new(),
            overage: OveragePolicy::default(),
        }
    }

    /// A concurrency limit whose holds expire after `timeout_seconds`.
    pub fn concurrency(key: impl Into<LimitKey>, capacity: u64, timeout_seconds: u64) -> Self {
        Self {
            key: key.into(),
            kind: LimitKind::Concurrency,
            capacity,
            window_seconds: 0,
            timeout_seconds,
            unit: String::new(),
            description: String::new(),
            overage: OveragePolicy::default(),
        }
    }

    pub fn with_overage(mut self, overage: OveragePolicy) -> Self {
        self.overage = overage;
        self
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// How long one reservation against this key stays live.
    pub fn hold_duration(&self) -> Duration {
        match self.kind {
            LimitKind::Rolling => Duration::from_secs(self.window_seconds),
            LimitKind::Concurrency => Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// Runtime state of a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitState {
    pub definition: LimitDefinition,
    #[serde(default)]
    pub status: LimitStatus,
    #[serde(default)]
    pub pending_decrease_to: u64,
}

impl LimitState {
    pub fn active(definition: LimitDefinition) -> Self {
        Self {
            definition,
            status: LimitStatus::Active,
            pending_decrease_to: 0,
        }
    }

    pub fn decreasing(definition: LimitDefinition, target: u64) -> Self {
        Self {
            definition,
            status: LimitStatus::Decreasing,
            pending_decrease_to: target,
        }
    }

    pub fn key(&self) -> &LimitKey {
        &self.definition.key
    }

    pub fn is_decreasing(&self) -> bool {
        self.status == LimitStatus::Decreasing
    }
}

/// A request to reserve `amount` units of `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: LimitKey,
    pub amount: u64,
}

impl Requirement {
    pub fn new(key: impl Into<LimitKey>, amount: u64) -> Self {
        Self {
            key: key.into(),
            amount,
        }
    }
}

/// True usage reported at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actual {
    pub key: LimitKey,
    pub actual_amount: u64,
}

impl Actual {
    pub fn new(key: impl Into<LimitKey>, actual_amount: u64) -> Self {
        Self {
            key: key.into(),
            actual_amount,
        }
    }
}

/// Asks to reserve capacity for a lease.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub lease_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

impl ReserveRequest {
    pub fn new(lease_id: impl Into<String>, requirements: Vec<Requirement>) -> Self {
        Self {
            lease_id: lease_id.into(),
            job_id: String::new(),
            requirements,
        }
    }
}

/// Whether a reservation was allowed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub allowed: bool,
    #[serde(default)]
    pub retry_after_ms: u64,
    #[serde(default)]
    pub reserved_at_unix_ms: i64,
    #[serde(default)]
    pub error: String,
}

impl ReserveResponse {
    pub fn allowed(reserved_at_unix_ms: i64) -> Self {
        Self {
            allowed: true,
            reserved_at_unix_ms,
            ..Self::default()
        }
    }

    /// Plain capacity denial; the caller should retry after the hint.
    pub fn denied(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
            ..Self::default()
        }
    }

    pub fn denied_with(retry_after_ms: u64, error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn invalid() -> Self {
        Self::denied_with(0, INVALID_REQUEST)
    }

    pub fn backend_error() -> Self {
        Self::denied_with(0, BACKEND_ERROR)
    }
}

/// Reports actual usage for a lease.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub lease_id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub actuals: Vec<Actual>,
}

impl CompleteRequest {
    pub fn new(lease_id: impl Into<String>, actuals: Vec<Actual>) -> Self {
        Self {
            lease_id: lease_id.into(),
            job_id: String::new(),
            actuals,
        }
    }
}

/// Whether completion succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

impl CompleteResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

/// One reserve outcome inside a batch; same shape as a single response.
pub type BatchReserveResult = ReserveResponse;

/// One complete outcome inside a batch.
pub type BatchCompleteResult = CompleteResponse;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchReserveRequest {
    pub requests: Vec<ReserveRequest>,
}

/// Reserve results in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchReserveResponse {
    pub results: Vec<BatchReserveResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCompleteRequest {
    pub requests: Vec<CompleteRequest>,
}

/// Complete results in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCompleteResponse {
    pub results: Vec<BatchCompleteResult>,
}
