//! The request dispatch engine.
//!
//! One inbound request flows router → scheduler → persistence → proxy.
//! Transport-level backend failures are accounted against the backend's
//! health and the request is redispatched through the full pipeline, up
//! to a per-request hop limit. WebSocket upgrades branch off into
//! [`crate::websocket`] after backend selection.

use crate::backend::{DispatchGuard, HealthPolicy};
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::router::Router;
use crate::scheduler::RequestContext;
use crate::stats::{ProcessStats, StatsSnapshot};
use crate::websocket::{self, PairRegistry, WebSocketOptions};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::Service;
use tracing::{info, warn};

/// Body type flowing through the engine.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Tunables for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum dispatch attempts for one inbound request.
    pub hop_limit: usize,
    pub health: HealthPolicy,
    pub websocket: WebSocketOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            hop_limit: 3,
            health: HealthPolicy::default(),
            websocket: WebSocketOptions::default(),
        }
    }
}

/// The proxy engine bound to a router.
pub struct ProxyEngine {
    router: Router,
    client: Client<HttpConnector, ProxyBody>,
    hop_limit: usize,
    health: HealthPolicy,
    websocket: WebSocketOptions,
    registry: Arc<PairRegistry>,
    stats: ProcessStats,
}

impl ProxyEngine {
    pub fn new(router: Router, options: EngineOptions) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let stats = ProcessStats::new(
            router.default_pool().scheduler_name(),
            router.default_pool().persistence_name(),
            router.route_patterns(),
        );
        Self {
            router,
            client,
            hop_limit: options.hop_limit,
            health: options.health,
            websocket: options.websocket,
            registry: Arc::new(PairRegistry::new()),
            stats,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Arc<PairRegistry> {
        &self.registry
    }

    /// Point-in-time counters for the stats surface.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.router, self.registry.count())
    }

    /// Entry point for one inbound request.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
        tls: bool,
    ) -> Response<ProxyBody> {
        self.stats.record_request();
        Metrics::inc_requests_in_flight();
        let result = if websocket::is_upgrade_request(&req) {
            self.handle_websocket(req, peer_addr, tls)
        } else {
            self.forward_http(req, peer_addr, tls).await
        };
        Metrics::dec_requests_in_flight();

        match result {
            Ok(response) => response,
            Err(ProxyError::NoHealthyBackend) => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "No healthy backends available",
            ),
            Err(e) => {
                warn!(error = %e, "dispatch failed");
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    fn handle_websocket(
        &self,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
        tls: bool,
    ) -> Result<Response<ProxyBody>> {
        let ctx = RequestContext {
            method: req.method(),
            path: req.uri().path(),
            headers: req.headers(),
            peer_addr: Some(peer_addr),
            tls,
        };
        let pool = self.router.route(&ctx);
        let selection = pool.dispatch(&ctx).ok_or(ProxyError::NoHealthyBackend)?;
        let backend = Arc::clone(pool.backend(selection.index));
        let guard = backend.begin_request();

        websocket::proxy_upgrade(
            req,
            backend,
            guard,
            Arc::clone(&self.registry),
            self.websocket.clone(),
            self.health.clone(),
        )
    }

    async fn forward_http(
        &self,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
        tls: bool,
    ) -> Result<Response<ProxyBody>> {
        let started = Instant::now();
        let method_label = req.method().to_string();
        let (parts, body) = req.into_parts();
        // The body rides along on the first attempt only; redispatch
        // after a transport failure replays the request head.
        let mut body = Some(body);

        for _ in 0..self.hop_limit {
            let ctx = RequestContext {
                method: &parts.method,
                path: parts.uri.path(),
                headers: &parts.headers,
                peer_addr: Some(peer_addr),
                tls,
            };
            let pool = self.router.route(&ctx);
            let Some(selection) = pool.dispatch(&ctx) else {
                Metrics::record_request(&method_label, 503, "-", started.elapsed().as_secs_f64());
                return Err(ProxyError::NoHealthyBackend);
            };
            let backend = Arc::clone(pool.backend(selection.index));
            let guard = backend.begin_request();

            let uri = upstream_uri(backend.url().scheme(), &backend.authority(), &parts.uri)?;
            let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
            if let Some(headers) = builder.headers_mut() {
                copy_forward_headers(&parts.headers, headers, peer_addr);
            }
            let attempt_body: ProxyBody = match body.take() {
                Some(inbound) => inbound.boxed(),
                None => empty_body(),
            };
            let outbound = builder.body(attempt_body)?;

            match self.client.request(outbound).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    info!(
                        method = %method_label,
                        status,
                        backend = %backend.url(),
                        "request completed"
                    );
                    Metrics::record_request(
                        &method_label,
                        status,
                        backend.url().as_str(),
                        started.elapsed().as_secs_f64(),
                    );

                    let (mut head, resp_body) = response.into_parts();
                    if let Some(cookie) = pool.session_cookie(&selection, &ctx) {
                        head.headers.append(header::SET_COOKIE, cookie);
                    }
                    // The guard rides inside the body so the connection
                    // gauge drops only once the response is fully
                    // written (or the client goes away).
                    let counted = CountedBody {
                        inner: resp_body.boxed(),
                        _guard: guard,
                    };
                    return Ok(Response::from_parts(head, BoxBody::new(counted)));
                }
                Err(e) => {
                    drop(guard);
                    warn!(
                        backend = %backend.url(),
                        error = %e,
                        "backend request failed, redispatching"
                    );
                    backend.record_failure(&self.health);
                }
            }
        }

        Metrics::record_request(&method_label, 502, "-", started.elapsed().as_secs_f64());
        Err(ProxyError::RetryExhausted {
            attempts: self.hop_limit,
        })
    }
}

/// Response body that keeps the backend's connection accounting alive
/// until the body is done.
struct CountedBody {
    inner: ProxyBody,
    _guard: DispatchGuard,
}

impl Body for CountedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Rewrites the request target onto the chosen backend, keeping the
/// original path and query.
fn upstream_uri(scheme: &str, authority: &str, original: &Uri) -> Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{scheme}://{authority}{path_and_query}")
        .parse()
        .map_err(|e| ProxyError::BackendTransport {
            backend: authority.to_string(),
            message: format!("invalid upstream URI: {e}"),
        })
}

/// Copies request headers minus hop-by-hop ones and stamps the client
/// address onto `X-Forwarded-For`.
fn copy_forward_headers(src: &HeaderMap, dst: &mut HeaderMap, peer_addr: SocketAddr) {
    let x_forwarded_for = HeaderName::from_static("x-forwarded-for");

    let connection_opts: Vec<String> = src
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in src {
        if is_hop_by_hop(name) || *name == x_forwarded_for {
            continue;
        }
        if connection_opts.iter().any(|token| token == name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }

    let mut forwarded: Vec<String> = src
        .get_all(&x_forwarded_for)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .collect();
    forwarded.push(peer_addr.ip().to_string());
    if let Ok(value) = HeaderValue::from_str(&forwarded.join(", ")) {
        dst.insert(x_forwarded_for, value);
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::PROXY_AUTHENTICATE
        || *name == header::PROXY_AUTHORIZATION
        || name.as_str() == "keep-alive"
}

/// Builds a plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| Response::new(empty_body()))
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// `tower::Service` adapter binding an engine to one client connection.
#[derive(Clone)]
pub struct EngineService {
    engine: Arc<ProxyEngine>,
    peer_addr: SocketAddr,
    tls: bool,
}

impl EngineService {
    pub fn new(engine: Arc<ProxyEngine>, peer_addr: SocketAddr, tls: bool) -> Self {
        Self {
            engine,
            peer_addr,
            tls,
        }
    }
}

impl Service<Request<Incoming>> for EngineService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let engine = Arc::clone(&self.engine);
        let peer_addr = self.peer_addr;
        let tls = self.tls;
        Box::pin(async move { Ok(engine.handle(req, peer_addr, tls).await) })
    }
}
