//! Runtime counters and their JSON-facing snapshot.
//!
//! The dispatch path only touches atomic counters; snapshotting walks
//! the pools and serializes whatever the atomics hold at that instant.

use crate::router::Router;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process-global counters, created once per engine.
#[derive(Debug)]
pub struct ProcessStats {
    started_at: Instant,
    started_at_epoch: u64,
    total_requests: AtomicU64,
    method: &'static str,
    persistence: &'static str,
    route_patterns: Vec<String>,
}

impl ProcessStats {
    pub fn new(method: &'static str, persistence: &'static str, route_patterns: Vec<String>) -> Self {
        Self {
            started_at: Instant::now(),
            started_at_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            total_requests: AtomicU64::new(0),
            method,
            persistence,
            route_patterns,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn persistence(&self) -> &'static str {
        self.persistence
    }

    /// Builds the externally visible snapshot from the live counters.
    pub fn snapshot(&self, router: &Router, websocket_connections: usize) -> StatsSnapshot {
        let mut backends = Vec::new();
        for pool in router.pools() {
            for backend in pool.backends() {
                backends.push(BackendSnapshot {
                    url: backend.url().to_string(),
                    pool: pool.name().to_string(),
                    alive: backend.is_alive(),
                    weight: backend.weight(),
                    request_count: backend.request_count(),
                    error_count: backend.error_count(),
                    active_connections: backend.active_connections(),
                    load_percentage: 0.0,
                });
            }
        }
        let total: u64 = backends.iter().map(|b| b.request_count).sum();
        if total > 0 {
            for backend in &mut backends {
                backend.load_percentage = backend.request_count as f64 / total as f64 * 100.0;
            }
        }

        StatsSnapshot {
            method: self.method,
            persistence_type: self.persistence,
            total_requests: self.total_requests(),
            start_time: self.started_at_epoch,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            websocket_connections,
            routes: self.route_patterns.clone(),
            backends,
        }
    }
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub url: String,
    pub pool: String,
    pub alive: bool,
    pub weight: u32,
    pub request_count: u64,
    pub error_count: u32,
    pub active_connections: usize,
    pub load_percentage: f64,
}

/// Point-in-time view of the whole balancer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub method: &'static str,
    pub persistence_type: &'static str,
    pub total_requests: u64,
    pub start_time: u64,
    pub uptime_seconds: u64,
    pub websocket_connections: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    pub backends: Vec<BackendSnapshot>,
}
