//! Builds the dispatch pipeline from a validated configuration.
//!
//! One base scheduler per pool, an optional persistence decorator
//! around each, a router over the pools, and the engine bound to the
//! router.

use crate::backend::{Backend, BackendPool};
use crate::config::{Algorithm, Config, PersistenceConfig, RouteDirective};
use crate::error::Result;
use crate::persistence::{PersistentScheduler, SessionPolicy, DEFAULT_RING_REPLICAS};
use crate::proxy::{EngineOptions, ProxyEngine};
use crate::router::{RouteRule, Router};
use crate::scheduler::{LeastConnections, RoundRobin, Scheduler, WeightedRoundRobin};
use std::sync::Arc;
use std::time::Duration;

/// Builds the full engine for a configuration.
pub fn build_engine(config: &Config, options: EngineOptions) -> Result<ProxyEngine> {
    Ok(ProxyEngine::new(build_router(config)?, options))
}

/// Builds the router (pools, schedulers, persistence, rules) alone.
pub fn build_router(config: &Config) -> Result<Router> {
    let mut pools = Vec::with_capacity(config.pools.len());
    for pool_config in &config.pools {
        let backends = pool_config
            .servers
            .iter()
            .map(|server| Backend::new(&server.url, server.weight, server.max_conns).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let base = base_scheduler(config.method, &backends);
        let policy = session_policy(&config.persistence, &backends);
        pools.push(BackendPool::new(
            pool_config.name.clone(),
            backends,
            PersistentScheduler::new(base, policy),
        ));
    }

    let rules = config
        .routes
        .iter()
        .map(|route| match route {
            RouteDirective::Path { prefix, pool } => {
                Ok(RouteRule::path_prefix(prefix.clone(), pool.clone()))
            }
            RouteDirective::Regex { pattern, pool } => {
                RouteRule::path_regex(pattern.clone(), pool.clone())
            }
            RouteDirective::Header { name, value, pool } => {
                Ok(RouteRule::header(name.clone(), value.clone(), pool.clone()))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Router::new(pools, rules, config.default_pool_name()?)
}

fn base_scheduler(algorithm: Algorithm, backends: &[Arc<Backend>]) -> Box<dyn Scheduler> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new(backends)),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
    }
}

fn session_policy(persistence: &PersistenceConfig, backends: &[Arc<Backend>]) -> SessionPolicy {
    match persistence {
        PersistenceConfig::None => SessionPolicy::None,
        PersistenceConfig::Cookie { name, ttl_seconds } => SessionPolicy::Cookie {
            name: name.clone(),
            ttl: Duration::from_secs(*ttl_seconds),
        },
        PersistenceConfig::IpHash => SessionPolicy::ip_hash(),
        PersistenceConfig::ConsistentHash => {
            SessionPolicy::consistent_hash(backends, DEFAULT_RING_REPLICAS)
        }
    }
}
