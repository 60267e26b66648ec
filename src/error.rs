//! Error types for the load balancer.

use std::io;
use thiserror::Error;

/// Errors that can occur while loading configuration or proxying requests.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// Every backend in the selected pool is marked dead.
    #[error("no healthy backends available")]
    NoHealthyBackend,

    /// Transport-level failure talking to a backend (connect refused,
    /// reset before response headers). Accounted against the backend and
    /// eligible for redispatch.
    #[error("backend transport error for {backend}: {message}")]
    BackendTransport { backend: String, message: String },

    /// The per-request hop limit was reached without a successful dispatch.
    #[error("all {attempts} dispatch attempts exhausted")]
    RetryExhausted { attempts: usize },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed request or response construction.
    #[error("http build error: {0}")]
    HttpBuild(#[from] http::Error),

    /// WebSocket handshake or framing error on either peer.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The client asked for an upgrade but the handshake request is malformed.
    #[error("invalid websocket upgrade: {0}")]
    InvalidUpgrade(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration. Raised only at load time, fatal to startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
