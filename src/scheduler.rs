//! Scheduling strategies for picking a backend within a pool.
//!
//! A scheduler is a single capability: given the per-request context and
//! the pool's backend list, return the index of an alive backend or
//! `None` when the whole pool is dead. Selection never performs I/O and
//! never suspends; the only synchronization is the short per-pool
//! critical section around the weighted-round-robin credits.

use crate::backend::Backend;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The slice of request state that scheduling and persistence decisions
/// are allowed to see. Built once per dispatch from the request head.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub method: &'a http::Method,
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub peer_addr: Option<SocketAddr>,
    /// Whether the inbound connection arrived over TLS (set by the
    /// embedding when it terminates TLS in front of the core).
    pub tls: bool,
}

/// Outcome of one dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Index of the chosen backend within its pool.
    pub index: usize,
    /// True when the choice came from session state (cookie, IP map or
    /// hash ring) rather than the base scheduler.
    pub sticky: bool,
}

/// A backend-selection strategy.
pub trait Scheduler: Send + Sync {
    /// Picks an alive backend index, or `None` if none is available.
    fn choose(&self, backends: &[Arc<Backend>], ctx: &RequestContext<'_>) -> Option<usize>;

    /// Human-readable strategy name for the stats surface.
    fn name(&self) -> &'static str;
}

/// Plain round robin. One monotonic counter modulo the pool size; dead
/// backends are skipped by a bounded probe. Weights are ignored.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn choose(&self, backends: &[Arc<Backend>], _ctx: &RequestContext<'_>) -> Option<usize> {
        let total = backends.len();
        if total == 0 {
            return None;
        }
        for _ in 0..total {
            let idx = self.counter.fetch_add(1, Ordering::Relaxed) % total;
            if backends[idx].is_alive() {
                return Some(idx);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "Round Robin"
    }
}

/// Smooth weighted round robin.
///
/// Every alive backend earns its weight in credit on each dispatch; the
/// highest credit wins (lowest index on ties) and pays back the total
/// weight. Over one full cycle of `total_weight` dispatches with all
/// backends alive, each backend is chosen exactly `weight` times and the
/// credits return to zero.
pub struct WeightedRoundRobin {
    credits: Mutex<Vec<i64>>,
    total_weight: i64,
}

impl WeightedRoundRobin {
    pub fn new(backends: &[Arc<Backend>]) -> Self {
        let total_weight = backends.iter().map(|b| b.weight() as i64).sum();
        Self {
            credits: Mutex::new(vec![0; backends.len()]),
            total_weight,
        }
    }
}

impl Scheduler for WeightedRoundRobin {
    fn choose(&self, backends: &[Arc<Backend>], _ctx: &RequestContext<'_>) -> Option<usize> {
        let mut credits = self.credits.lock();
        let mut best: Option<usize> = None;
        for (i, backend) in backends.iter().enumerate() {
            if !backend.is_alive() {
                continue;
            }
            credits[i] += backend.weight() as i64;
            best = match best {
                Some(j) if credits[j] >= credits[i] => Some(j),
                _ => Some(i),
            };
        }
        let chosen = best?;
        credits[chosen] -= self.total_weight;
        Some(chosen)
    }

    fn name(&self) -> &'static str {
        "Weighted Round Robin"
    }
}

/// Least connections. Picks the alive backend with the fewest in-flight
/// requests; ties prefer the heavier weight, then the lowest index.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for LeastConnections {
    fn choose(&self, backends: &[Arc<Backend>], _ctx: &RequestContext<'_>) -> Option<usize> {
        let mut best: Option<(usize, usize, u32)> = None;
        for (i, backend) in backends.iter().enumerate() {
            if !backend.is_alive() {
                continue;
            }
            let conns = backend.active_connections();
            let weight = backend.weight();
            best = match best {
                None => Some((i, conns, weight)),
                Some((_, c, w)) if conns < c || (conns == c && weight > w) => {
                    Some((i, conns, weight))
                }
                other => other,
            };
        }
        best.map(|(i, _, _)| i)
    }

    fn name(&self) -> &'static str {
        "Least Connections"
    }
}
