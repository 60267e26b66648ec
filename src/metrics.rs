//! Prometheus metrics collection and export.
//!
//! Follows RED methodology: request rate, errors and duration, plus
//! gauges for in-flight requests and live WebSocket pairs.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// HTTP status code (200, 502, etc.)
    pub status: String,
    /// Backend the request was dispatched to.
    pub backend: String,
}

/// Global metrics registry, initialized once and shared across tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the balancer.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<HttpLabels, Counter>,
    request_duration_seconds: Family<HttpLabels, Histogram>,
    requests_in_flight: Gauge<i64, AtomicI64>,
    errors_total: Family<HttpLabels, Counter>,
    websocket_pairs_active: Gauge<i64, AtomicI64>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total number of proxied HTTP requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                // Buckets from 1ms to 4s, doubling.
                Histogram::new(exponential_buckets(0.001, 2.0, 13))
            });
        registry.register(
            "http_request_duration_seconds",
            "Proxied request latency in seconds",
            request_duration_seconds.clone(),
        );

        let requests_in_flight = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "http_requests_in_flight",
            "Number of HTTP requests currently being proxied",
            requests_in_flight.clone(),
        );

        let errors_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_errors_total",
            "Total number of HTTP error responses (4xx and 5xx)",
            errors_total.clone(),
        );

        let websocket_pairs_active = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "websocket_pairs_active",
            "Number of open WebSocket client/backend pairs",
            websocket_pairs_active.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            requests_in_flight,
            errors_total,
            websocket_pairs_active,
        }
    }

    /// Records one proxied request with its final status and duration.
    pub fn record_request(method: &str, status: u16, backend: &str, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            status: status.to_string(),
            backend: backend.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
            if status >= 400 {
                metrics.errors_total.get_or_create(&labels).inc();
            }
        }
    }

    pub fn inc_requests_in_flight() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_in_flight.inc();
        }
    }

    pub fn dec_requests_in_flight() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_in_flight.dec();
        }
    }

    pub fn inc_websocket_pairs() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.websocket_pairs_active.inc();
        }
    }

    pub fn dec_websocket_pairs() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.websocket_pairs_active.dec();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {e}")))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {e}")))?;

        Ok(buffer)
    }
}
