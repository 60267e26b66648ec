//! Backend model and health accounting.
//!
//! A [`Backend`] is an immutable origin identity (parsed URL plus
//! configured weight) carrying the mutable runtime state the dispatch
//! path needs: liveness, error count, active connections and a request
//! counter. All runtime state is atomic; the dispatch hot path never
//! takes a lock here.
//!
//! Health is passive. Proxy-level failures are accounted with
//! [`Backend::record_failure`]; when the failure threshold is crossed the
//! backend is pulled out of rotation and a one-shot revival task restores
//! it after the cooldown.

use crate::error::{ProxyError, Result};
use crate::persistence::PersistentScheduler;
use crate::scheduler::{RequestContext, Selection};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Passive health-check policy applied to every backend.
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Consecutive proxy failures before the backend is marked dead.
    pub failure_threshold: u32,
    /// How long a dead backend stays out of rotation.
    pub revival_cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            revival_cooldown: Duration::from_secs(10),
        }
    }
}

/// A single origin server.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    weight: u32,
    max_conns: u32,
    alive: AtomicBool,
    error_count: AtomicU32,
    active_connections: AtomicUsize,
    request_count: AtomicU64,
}

impl Backend {
    /// Parses the backend URL and builds a live backend.
    ///
    /// Only `http` and `https` schemes are accepted; anything else is a
    /// configuration error.
    pub fn new(raw_url: &str, weight: u32, max_conns: u32) -> Result<Self> {
        let url = Url::parse(raw_url)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid backend URL {raw_url}: {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::InvalidConfig(format!(
                    "unsupported backend scheme {other} in {raw_url}"
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(ProxyError::InvalidConfig(format!(
                "backend URL {raw_url} has no host"
            )));
        }
        Ok(Self {
            url,
            weight: weight.max(1),
            max_conns,
            alive: AtomicBool::new(true),
            error_count: AtomicU32::new(0),
            active_connections: AtomicUsize::new(0),
            request_count: AtomicU64::new(0),
        })
    }

    /// The parsed backend URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host` or `host:port` for the outbound request line.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        }
    }

    /// Configured weight (always at least 1).
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Configured connection cap (0 means unlimited). Informational only.
    pub fn max_conns(&self) -> u32 {
        self.max_conns
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Starts accounting one dispatched request.
    ///
    /// Bumps the request counter and active-connection gauge; the
    /// returned guard decrements the gauge exactly once when dropped,
    /// whether the response completed or the request errored out.
    pub fn begin_request(self: &Arc<Self>) -> DispatchGuard {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        DispatchGuard {
            backend: Arc::clone(self),
        }
    }

    /// Accounts one proxy-level failure against this backend.
    ///
    /// Crossing the failure threshold while alive marks the backend dead
    /// and schedules the one-shot revival task. Failures recorded while
    /// already dead only bump the counter; no extra timer is created.
    pub fn record_failure(self: &Arc<Self>, policy: &HealthPolicy) {
        let failures = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < policy.failure_threshold {
            return;
        }
        if self.alive.swap(false, Ordering::AcqRel) {
            warn!(backend = %self.url, failures, "backend marked dead");
            let backend = Arc::clone(self);
            let cooldown = policy.revival_cooldown;
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                backend.revive();
            });
        }
    }

    /// Puts the backend back into rotation with a clean error count.
    pub fn revive(&self) {
        self.error_count.store(0, Ordering::Release);
        self.alive.store(true, Ordering::Release);
        info!(backend = %self.url, "backend revived");
    }
}

/// RAII guard for one in-flight request against a backend.
///
/// Dropping the guard ends the accounting; the gauge saturates at zero
/// so a stray double-drop can never drive it negative.
#[derive(Debug)]
pub struct DispatchGuard {
    backend: Arc<Backend>,
}

impl DispatchGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let _ = self
            .backend
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// A named, ordered set of backends bound to a scheduler.
///
/// The backend list is fixed at construction; only the per-backend
/// atomic state changes at runtime. Schedulers address backends by index
/// into this list.
pub struct BackendPool {
    name: String,
    backends: Vec<Arc<Backend>>,
    scheduler: PersistentScheduler,
}

impl BackendPool {
    pub fn new(name: impl Into<String>, backends: Vec<Arc<Backend>>, scheduler: PersistentScheduler) -> Self {
        Self {
            name: name.into(),
            backends,
            scheduler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn backend(&self, index: usize) -> &Arc<Backend> {
        &self.backends[index]
    }

    /// Selects a backend for one request, honoring the pool's
    /// persistence policy before falling back to the base scheduler.
    pub fn dispatch(&self, ctx: &RequestContext<'_>) -> Option<Selection> {
        self.scheduler.choose(&self.backends, ctx)
    }

    /// Session cookie to set on the response for a fresh selection, if
    /// the pool uses cookie persistence.
    pub fn session_cookie(&self, selection: &Selection, ctx: &RequestContext<'_>) -> Option<http::HeaderValue> {
        self.scheduler.session_cookie(&self.backends, selection, ctx)
    }

    pub fn persistence_name(&self) -> &'static str {
        self.scheduler.policy_name()
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.scheduler_name()
    }
}
