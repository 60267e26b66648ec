//! Admin endpoints: health, Prometheus metrics and the stats snapshot.

use crate::metrics::Metrics;
use crate::proxy::{ProxyBody, ProxyEngine};
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

/// Admin service for the observability surface.
///
/// Serves:
/// - `/health` - liveness check returning 200 OK
/// - `/metrics` - Prometheus metrics in text format
/// - `/api/stats` - JSON snapshot of the balancer counters
#[derive(Clone)]
pub struct AdminService {
    engine: Arc<ProxyEngine>,
}

impl AdminService {
    pub fn new(engine: Arc<ProxyEngine>) -> Self {
        Self { engine }
    }

    async fn handle_request(
        engine: Arc<ProxyEngine>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let path = req.uri().path();

        match path {
            "/health" => {
                debug!("health check requested");
                Ok(text_response(StatusCode::OK, "OK", "text/plain"))
            }
            "/metrics" => match Metrics::encode() {
                Ok(metrics) => Ok(text_response(
                    StatusCode::OK,
                    &metrics,
                    "text/plain; version=0.0.4; charset=utf-8",
                )),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    Ok(text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode metrics",
                        "text/plain",
                    ))
                }
            },
            "/api/stats" => match serde_json::to_string(&engine.stats_snapshot()) {
                Ok(body) => Ok(text_response(StatusCode::OK, &body, "application/json")),
                Err(e) => {
                    warn!("failed to encode stats: {}", e);
                    Ok(text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to encode stats",
                        "text/plain",
                    ))
                }
            },
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found", "text/plain")),
        }
    }
}

fn text_response(status: StatusCode, body: &str, content_type: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(body.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap_or_else(|_| Response::new(crate::proxy::empty_body()))
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let engine = Arc::clone(&self.engine);
        Box::pin(Self::handle_request(engine, req))
    }
}
