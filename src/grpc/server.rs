//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_server::AdmissionServer;
use super::service::AdmissionService;
use crate::api::AdmissionApi;
use crate::error::{AdmissionError, Result};
use crate::ratelimit::backend::Backend;

/// gRPC server for the admission service.
pub struct GrpcServer<B: ?Sized> {
    /// Address to bind to
    addr: SocketAddr,
    api: Arc<AdmissionApi<B>>,
    default_timeout: Option<Duration>,
}

impl<B: Backend + ?Sized + 'static> GrpcServer<B> {
    pub fn new(addr: SocketAddr, api: Arc<AdmissionApi<B>>) -> Self {
        Self {
            addr,
            api,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn service(&self) -> AdmissionServer<AdmissionService<B>> {
        let mut service = AdmissionService::new(self.api.clone());
        if let Some(timeout) = self.default_timeout {
            service = service.with_default_timeout(timeout);
        }
        AdmissionServer::new(service)
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(addr = %self.addr, "Starting gRPC server for admission service");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                AdmissionError::Transport(e)
            })
    }

    /// Serve on an already bound listener; used when the port is chosen by
    /// the OS.
    pub async fn serve_with_listener<F>(self, listener: tokio::net::TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(incoming, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                AdmissionError::Transport(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::ratelimit::clock::{Clock, SystemClock};
    use crate::ratelimit::registry::Registry;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = Arc::new(MemoryBackend::new(clock.clone()));
        let api = Arc::new(AdmissionApi::new(Arc::new(Registry::new()), backend, None, clock));
        let _server = GrpcServer::new(addr, api).with_default_timeout(Duration::from_secs(1));
    }
}
