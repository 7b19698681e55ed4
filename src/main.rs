use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use admission::api::AdmissionApi;
use admission::backend::{LedgerBackend, LedgerBackendConfig, MemoryBackend};
use admission::config::{load_limits, BackendKind, ServiceConfig};
use admission::grpc::GrpcServer;
use admission::ledger::{LedgerClient, LocalLedger};
use admission::ratelimit::{Backend, CallContext, Clock, LoadableState, Registry, SystemClock};

/// Reserve/Complete admission server.
#[derive(Debug, Parser)]
#[command(name = "admissiond", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Admission engine, overriding the configuration
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// gRPC listen address, overriding the configuration
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// YAML list of limit definitions applied at startup
    #[arg(long)]
    limits: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(BackendKind::Memory),
        "ledger" => Ok(BackendKind::Ledger),
        other => Err(format!("unknown backend {:?}; expected memory or ledger", other)),
    }
}

/// Engine-specific handles kept for shutdown.
enum Engine {
    Memory {
        stop: watch::Sender<bool>,
        sweep: tokio::task::JoinHandle<()>,
    },
    Ledger(Arc<LedgerBackend>),
}

impl Engine {
    async fn shutdown(self) {
        match self {
            Engine::Memory { stop, sweep } => {
                let _ = stop.send(true);
                let _ = sweep.await;
            }
            Engine::Ledger(backend) => backend.shutdown().await,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.backend.kind,
        registry = %config.registry.path.display(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(Registry::new());
    registry.load(&config.registry.path)?;
    let registry_path = Some(config.registry.path.clone());
    let sweep_every = Duration::from_millis(config.backend.decrease_sweep_ms.max(1));

    let (backend, engine): (Arc<dyn Backend>, Engine) = match config.backend.kind {
        BackendKind::Memory => {
            let backend = Arc::new(MemoryBackend::new(clock.clone()));
            backend.attach_registry(registry.clone(), registry_path.clone());
            for state in registry.list() {
                backend.apply_state(state).await?;
            }
            let (stop, stop_rx) = watch::channel(false);
            let sweep = backend.spawn_decrease_sweep(sweep_every, stop_rx);
            (backend as Arc<dyn Backend>, Engine::Memory { stop, sweep })
        }
        BackendKind::Ledger => {
            let ledger: Arc<dyn LedgerClient> =
                Arc::new(LocalLedger::open(&config.ledger.journal_path, clock.clone())?);
            let backend = LedgerBackend::start(
                ledger,
                registry.clone(),
                LedgerBackendConfig {
                    submitter: config.ledger.submitter(),
                    retry: config.retry.clone(),
                    registry_path: registry_path.clone(),
                    decrease_interval: sweep_every,
                },
                clock.clone(),
            )
            .await?;
            (backend.clone() as Arc<dyn Backend>, Engine::Ledger(backend))
        }
    };
    info!(limits = registry.list().len(), "Backend initialized");

    let api = Arc::new(AdmissionApi::new(registry.clone(), backend, registry_path, clock));
    if let Some(path) = &args.limits {
        for def in load_limits(path)? {
            let key = def.key.clone();
            let put = api.put_limit(CallContext::background(), def).await;
            match put {
                Ok(resp) => info!(key = %key, status = %resp.status, "Seed limit applied"),
                Err(e) => anyhow::bail!("seed limit {} rejected: {}", key, e),
            }
        }
    }

    let server = GrpcServer::new(config.server.grpc_addr, api);
    let server = if config.server.request_timeout_ms > 0 {
        server.with_default_timeout(Duration::from_millis(config.server.request_timeout_ms))
    } else {
        server
    };

    info!("Starting gRPC server on {}", config.server.grpc_addr);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    engine.shutdown().await;
    served?;

    info!("Admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
