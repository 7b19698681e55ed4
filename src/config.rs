//! Configuration management for the admission service and its clients.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AdmissionError, Result};
use crate::grpc::RemoteLimiter;
use crate::ledger::SubmitterConfig;
use crate::ratelimit::batcher::Batcher;
use crate::ratelimit::retry::RetryPolicy;
use crate::ratelimit::scheduler::SchedulerConfig;
use crate::ratelimit::types::{LimitDefinition, LimitState};
use crate::ratelimit::{LocalLimiter, Limiter, NoopLimiter};

/// Main configuration for `admissiond`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Retry-after hints issued by the ledger engine
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Deadline for calls that arrive without `grpc-timeout`
    #[serde(default = "default_server_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            request_timeout_ms: default_server_timeout_ms(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_server_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON file holding every limit state
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/registry.json")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Ledger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// How often gated capacity decreases are retried
    #[serde(default = "default_decrease_sweep_ms")]
    pub decrease_sweep_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            decrease_sweep_ms: default_decrease_sweep_ms(),
        }
    }
}

fn default_decrease_sweep_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Append-only journal of the local ledger
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,

    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    #[serde(default = "default_flush_interval_us")]
    pub flush_interval_us: u64,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
            max_batch_events: default_max_batch_events(),
            flush_interval_us: default_flush_interval_us(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl LedgerConfig {
    pub fn submitter(&self) -> SubmitterConfig {
        SubmitterConfig {
            max_events: self.max_batch_events.max(1),
            flush_every: Duration::from_micros(self.flush_interval_us.max(1)),
            queue_depth: self.queue_depth.max(1),
        }
    }
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/ledger.journal")
}

fn default_max_batch_events() -> usize {
    8000
}

fn default_flush_interval_us() -> u64 {
    200
}

fn default_queue_depth() -> usize {
    4096
}

impl ServiceConfig {
    /// Layer an optional YAML file under `ADMISSION__*` environment
    /// variables (for example `ADMISSION__BACKEND__KIND=ledger`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ADMISSION")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let config: ServiceConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AdmissionError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| AdmissionError::Config(e.to_string()))
    }
}

/// Limit definitions to apply at startup, stored as a YAML list.
pub fn load_limits(path: impl AsRef<Path>) -> Result<Vec<LimitDefinition>> {
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents).map_err(|e| AdmissionError::Config(e.to_string()))
}

/// How an application reaches its rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterMode {
    /// Everything is admitted.
    #[default]
    Disabled,
    /// Calls go to `admissiond` at `base_url`.
    Remote,
    /// An in-process memory engine seeded from `limits_path`.
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Single calls coalesced per batch; one or less disables batching
    #[serde(default)]
    pub size: usize,

    #[serde(default = "default_batch_flush_ms")]
    pub flush_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 0,
            flush_ms: default_batch_flush_ms(),
        }
    }
}

fn default_batch_flush_ms() -> u64 {
    2
}

/// Client-side limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub mode: LimiterMode,

    #[serde(default)]
    pub base_url: String,

    /// Registry JSON or YAML list of definitions for embedded mode
    #[serde(default)]
    pub limits_path: Option<PathBuf>,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub request_timeout_ms: u64,

    /// Scheduler worker count
    #[serde(default)]
    pub workers: usize,
}

/// A limiter built from [`RateLimiterConfig`], plus the batcher to stop on
/// shutdown when one was added.
pub struct LimiterHandle {
    limiter: Arc<dyn Limiter>,
    batcher: Option<Arc<Batcher>>,
}

impl LimiterHandle {
    pub fn limiter(&self) -> Arc<dyn Limiter> {
        self.limiter.clone()
    }

    pub async fn shutdown(&self) {
        if let Some(batcher) = &self.batcher {
            batcher.shutdown().await;
        }
    }
}

impl RateLimiterConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Scheduler settings; each Reserve and Complete is bounded by the
    /// request timeout.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers.max(1),
            call_timeout: self.request_timeout().unwrap_or(Duration::ZERO),
            ..SchedulerConfig::default()
        }
    }

    pub async fn build_limiter(&self) -> Result<LimiterHandle> {
        let base: Arc<dyn Limiter> = match self.mode {
            LimiterMode::Disabled => Arc::new(NoopLimiter),
            LimiterMode::Remote => {
                if self.base_url.trim().is_empty() {
                    return Err(AdmissionError::Config("remote limiter requires base_url".into()));
                }
                Arc::new(RemoteLimiter::new(self.base_url.trim(), self.request_timeout())?)
            }
            LimiterMode::Embedded => {
                let path = self
                    .limits_path
                    .as_deref()
                    .ok_or_else(|| AdmissionError::Config("embedded limiter requires limits_path".into()))?;
                Arc::new(embedded_limiter(path).await?)
            }
        };
        info!(mode = ?self.mode, batch = self.batch.size, "Rate limiter built");

        if self.batch.size <= 1 {
            return Ok(LimiterHandle {
                limiter: base,
                batcher: None,
            });
        }
        let batcher = Arc::new(Batcher::new(
            base,
            self.batch.size,
            Duration::from_millis(self.batch.flush_ms),
        ));
        Ok(LimiterHandle {
            limiter: batcher.clone(),
            batcher: Some(batcher),
        })
    }
}

async fn embedded_limiter(path: &Path) -> Result<LocalLimiter<crate::backend::MemoryBackend>> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        let states = load_limits(path)?.into_iter().map(LimitState::active).collect();
        LocalLimiter::memory_from_states(states).await
    } else {
        LocalLimiter::memory_from_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::context::CallContext;
    use crate::ratelimit::types::{LimitKind, ReserveRequest, Requirement};

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.grpc_addr.port(), 8081);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.ledger.max_batch_events, 8000);
        assert_eq!(config.ledger.submitter().flush_every, Duration::from_micros(200));
    }

    #[test]
    fn test_scheduler_inherits_request_timeout() {
        let config = RateLimiterConfig {
            request_timeout_ms: 250,
            ..Default::default()
        };
        let scheduler = config.scheduler();
        assert_eq!(scheduler.workers, 1);
        assert_eq!(scheduler.call_timeout, Duration::from_millis(250));

        let unbounded = RateLimiterConfig::default().scheduler();
        assert_eq!(unbounded.call_timeout, Duration::ZERO);
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.yaml");
        std::fs::write(
            &path,
            "server:\n  grpc_addr: 0.0.0.0:9000\nbackend:\n  kind: ledger\nledger:\n  max_batch_events: 100\n",
        )
        .unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.grpc_addr.port(), 9000);
        assert_eq!(config.backend.kind, BackendKind::Ledger);
        assert_eq!(config.ledger.max_batch_events, 100);
        assert_eq!(config.ledger.flush_interval_us, 200);

        let direct = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(direct.backend.kind, BackendKind::Ledger);
    }

    #[test]
    fn test_load_limits_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yaml");
        std::fs::write(
            &path,
            "- key: global:llm:openai:gpt:rpm\n  kind: rolling\n  capacity: 60\n  window_seconds: 60\n\
             - key: global:llm:openai:gpt:concurrency\n  kind: Concurrency\n  capacity: 4\n  timeout_seconds: 30\n  overage: deny\n",
        )
        .unwrap();
        let limits = load_limits(&path).unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[1].kind, LimitKind::Concurrency);
    }

    #[tokio::test]
    async fn test_build_disabled_limiter() {
        let handle = RateLimiterConfig::default().build_limiter().await.unwrap();
        let resp = handle
            .limiter()
            .reserve(CallContext::background(), ReserveRequest::new("L1", vec![Requirement::new("k", 1)]))
            .await
            .unwrap();
        assert!(resp.allowed);
    }

    #[tokio::test]
    async fn test_build_embedded_limiter_with_batcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.yml");
        std::fs::write(&path, "- key: k1\n  kind: rolling\n  capacity: 1\n  window_seconds: 60\n").unwrap();

        let config = RateLimiterConfig {
            mode: LimiterMode::Embedded,
            limits_path: Some(path),
            batch: BatchConfig { size: 4, flush_ms: 1 },
            ..Default::default()
        };
        let handle = config.build_limiter().await.unwrap();
        let limiter = handle.limiter();
        let first = limiter
            .reserve(CallContext::background(), ReserveRequest::new("L1", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap();
        let second = limiter
            .reserve(CallContext::background(), ReserveRequest::new("L2", vec![Requirement::new("k1", 1)]))
            .await
            .unwrap();
        assert!(first.allowed);
        assert!(!second.allowed);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_requires_url() {
        let config = RateLimiterConfig {
            mode: LimiterMode::Remote,
            ..Default::default()
        };
        assert!(matches!(config.build_limiter().await, Err(AdmissionError::Config(_))));
    }
}
