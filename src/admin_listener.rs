//! Admin listener serving the observability endpoints on their own port.

use crate::admin::AdminService;
use crate::error::{ProxyError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, instrument, warn};

/// Admin HTTP listener for health, metrics and stats endpoints.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin endpoints to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(admin_service))]
    pub async fn bind(addr: &str, admin_service: AdminService) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        Ok(Self {
            tcp_listener,
            admin_service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("admin connection from {}", peer_addr);
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single admin TCP connection.
    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::factory;
    use crate::proxy::EngineOptions;
    use std::sync::Arc;

    fn admin_service() -> AdminService {
        let config =
            Config::parse("upstream backend {\n server http://127.0.0.1:9999 \n}\n").unwrap();
        let engine = Arc::new(factory::build_engine(&config, EngineOptions::default()).unwrap());
        AdminService::new(engine)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0", admin_service()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let listener = AdminListener::bind("999.999.999.999:0", admin_service()).await;
        assert!(listener.is_err());
    }
}
