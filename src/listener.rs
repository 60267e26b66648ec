//! TCP listener for the proxy with graceful shutdown support.

use crate::error::{ProxyError, Result};
use crate::proxy::{EngineService, ProxyEngine};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, instrument, warn};

/// Accepts client connections and serves them through the engine.
///
/// Connections are HTTP/1.1 with upgrade support so WebSocket handshakes
/// can hijack the stream. Shutdown is signalled over a broadcast channel.
pub struct Listener {
    tcp_listener: TcpListener,
    engine: Arc<ProxyEngine>,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(engine))]
    pub async fn bind(addr: &str, engine: Arc<ProxyEngine>) -> Result<Self> {
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
            engine,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, peer_addr, engine).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single client connection over HTTP/1.1.
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        engine: Arc<ProxyEngine>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = EngineService::new(engine, peer_addr, false);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(ProxyError::Http)
    }
}
