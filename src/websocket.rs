//! WebSocket proxying.
//!
//! An upgrade request is answered directly (the accept key is derived
//! from the client's handshake) while a separate task dials the backend
//! over the translated `ws://`/`wss://` URL. Once both sides are up,
//! three cooperative tasks run per pair: the two message pumps and a
//! keepalive ticker pinging both peers. Any error or close on either
//! side tears the whole pair down.

use crate::backend::{Backend, DispatchGuard, HealthPolicy};
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::proxy::{empty_body, ProxyBody};
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Deadlines and limits for proxied WebSocket pairs.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Interval between keepalive pings to both peers.
    pub ping_interval: Duration,
    /// Read deadline; a peer silent for this long is considered gone.
    pub pong_wait: Duration,
    /// Write deadline for any single frame.
    pub write_wait: Duration,
    /// Maximum accepted message payload.
    pub max_message_size: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
        }
    }
}

impl WebSocketOptions {
    fn protocol_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }
}

/// True when the request is a WebSocket upgrade: GET with `Connection`
/// carrying the `Upgrade` token and `Upgrade` carrying `websocket`
/// (case-insensitive token match).
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.method() == http::Method::GET
        && header_has_token(req.headers(), &header::CONNECTION, "upgrade")
        && header_has_token(req.headers(), &header::UPGRADE, "websocket")
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// One live client/backend pair.
#[derive(Debug, Clone)]
pub struct WebSocketPair {
    pub backend_url: String,
}

/// ID-indexed registry of open pairs, for observability and shutdown.
#[derive(Debug, Default)]
pub struct PairRegistry {
    pairs: DashMap<Uuid, WebSocketPair>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend_url: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.pairs.insert(
            id,
            WebSocketPair {
                backend_url: backend_url.to_string(),
            },
        );
        id
    }

    pub fn remove(&self, id: &Uuid) {
        self.pairs.remove(id);
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.pairs.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.pairs.len()
    }
}

/// Answers the client handshake and spawns the pair task.
///
/// The returned `101 Switching Protocols` response must be written back
/// to the client for the upgrade to complete; the spawned task then owns
/// both sockets for the rest of the pair's life.
pub fn proxy_upgrade(
    mut req: Request<Incoming>,
    backend: Arc<Backend>,
    guard: DispatchGuard,
    registry: Arc<PairRegistry>,
    options: WebSocketOptions,
    health: HealthPolicy,
) -> Result<Response<ProxyBody>> {
    let key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(|| ProxyError::InvalidUpgrade("missing Sec-WebSocket-Key".to_string()))?;
    let accept_key = derive_accept_key(key.as_bytes());

    let backend_request = backend_handshake_request(&backend, req.uri(), req.headers())?;
    let upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(run_pair(
        upgrade,
        backend_request,
        backend,
        guard,
        registry,
        options,
        health,
    ));

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(empty_body())?;
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn run_pair(
    upgrade: hyper::upgrade::OnUpgrade,
    backend_request: tokio_tungstenite::tungstenite::handshake::client::Request,
    backend: Arc<Backend>,
    guard: DispatchGuard,
    registry: Arc<PairRegistry>,
    options: WebSocketOptions,
    health: HealthPolicy,
) {
    // Connection accounting spans the whole pair lifetime.
    let _guard = guard;

    let upgraded = match upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(error = %e, "client upgrade failed");
            return;
        }
    };
    let client_ws = WebSocketStream::from_raw_socket(
        TokioIo::new(upgraded),
        Role::Server,
        Some(options.protocol_config()),
    )
    .await;

    let backend_ws = match connect_async_with_config(
        backend_request,
        Some(options.protocol_config()),
        false,
    )
    .await
    {
        Ok((backend_ws, _response)) => backend_ws,
        Err(e) => {
            warn!(backend = %backend.url(), error = %e, "failed to open backend websocket");
            backend.record_failure(&health);
            let mut client_ws = client_ws;
            let _ = client_ws.close(None).await;
            return;
        }
    };

    let pair_id = registry.add(backend.url().as_str());
    Metrics::inc_websocket_pairs();
    info!(pair = %pair_id, backend = %backend.url(), "websocket pair established");

    let (client_sink, client_stream) = client_ws.split();
    let (backend_sink, backend_stream) = backend_ws.split();
    let client_sink = Arc::new(Mutex::new(client_sink));
    let backend_sink = Arc::new(Mutex::new(backend_sink));

    // Either pump finishing or a failed ping ends the pair.
    tokio::select! {
        _ = pump(client_stream, Arc::clone(&backend_sink), &options) => {}
        _ = pump(backend_stream, Arc::clone(&client_sink), &options) => {}
        _ = keepalive(Arc::clone(&client_sink), Arc::clone(&backend_sink), &options) => {}
    }

    close_sink(&client_sink).await;
    close_sink(&backend_sink).await;
    registry.remove(&pair_id);
    Metrics::dec_websocket_pairs();
    info!(pair = %pair_id, "websocket pair closed");
}

/// Forwards frames from one peer to the other, preserving the frame
/// type. Returns when the peer closes, errors, or goes silent past the
/// pong deadline.
async fn pump<S, K>(mut stream: S, sink: Arc<Mutex<K>>, options: &WebSocketOptions)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let message = match timeout(options.pong_wait, stream.next()).await {
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        if message.is_close() {
            let mut sink = sink.lock().await;
            let _ = timeout(options.write_wait, sink.send(message)).await;
            break;
        }
        // Pings and pongs are answered by the protocol layer on each leg.
        if message.is_ping() || message.is_pong() {
            continue;
        }

        let mut sink = sink.lock().await;
        match timeout(options.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

/// Pings both peers on the configured interval; the first failed or
/// timed-out write ends the pair.
async fn keepalive<A, B>(
    client_sink: Arc<Mutex<A>>,
    backend_sink: Arc<Mutex<B>>,
    options: &WebSocketOptions,
) where
    A: Sink<Message, Error = WsError> + Unpin,
    B: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = tokio::time::interval(options.ping_interval);
    // The first tick fires immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        {
            let mut sink = client_sink.lock().await;
            match timeout(options.write_wait, sink.send(Message::Ping(Vec::new()))).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
        {
            let mut sink = backend_sink.lock().await;
            match timeout(options.write_wait, sink.send(Message::Ping(Vec::new()))).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
    }
}

async fn close_sink<S>(sink: &Arc<Mutex<S>>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut sink = sink.lock().await;
    let _ = sink.close().await;
}

/// Builds the backend-side handshake request: the backend URL with its
/// scheme translated to `ws`/`wss` and the inbound path and query, plus
/// the forwarded headers minus the ones the handshake regenerates.
fn backend_handshake_request(
    backend: &Backend,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let url = backend_ws_url(backend, uri)?;
    let mut request = url.as_str().into_client_request()?;
    for (name, value) in headers {
        if is_handshake_header(name) {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    Ok(request)
}

fn backend_ws_url(backend: &Backend, uri: &Uri) -> Result<Url> {
    let mut url = backend.url().clone();
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => other,
    };
    let scheme = scheme.to_string();
    url.set_scheme(&scheme)
        .map_err(|_| ProxyError::InvalidUpgrade(format!("cannot translate scheme {scheme}")))?;
    url.set_path(uri.path());
    url.set_query(uri.query());
    Ok(url)
}

fn is_handshake_header(name: &HeaderName) -> bool {
    *name == header::HOST
        || *name == header::CONNECTION
        || *name == header::UPGRADE
        || *name == header::SEC_WEBSOCKET_KEY
        || *name == header::SEC_WEBSOCKET_VERSION
        || *name == header::SEC_WEBSOCKET_EXTENSIONS
        || *name == header::SEC_WEBSOCKET_PROTOCOL
}
