//! Rule-based routing of requests to backend pools.
//!
//! Rules are evaluated in declared order and the first match wins; a
//! request that matches nothing goes to the mandatory default pool.
//! Patterns are validated when the router is built, never per request.

use crate::backend::BackendPool;
use crate::error::{ProxyError, Result};
use crate::scheduler::RequestContext;
use regex::Regex;
use tracing::debug;

/// One routing rule, matched against the request head.
#[derive(Debug, Clone)]
pub enum RouteRule {
    /// Byte-exact prefix match on the URL path.
    PathPrefix { prefix: String, pool: String },
    /// Full-path regex match (compiled at build time).
    PathRegex {
        pattern: String,
        regex: Regex,
        pool: String,
    },
    /// Named header present with exactly this value.
    Header {
        name: String,
        value: String,
        pool: String,
    },
}

impl RouteRule {
    pub fn path_prefix(prefix: impl Into<String>, pool: impl Into<String>) -> Self {
        Self::PathPrefix {
            prefix: prefix.into(),
            pool: pool.into(),
        }
    }

    pub fn path_regex(pattern: impl Into<String>, pool: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid route regex {pattern}: {e}")))?;
        Ok(Self::PathRegex {
            pattern,
            regex,
            pool: pool.into(),
        })
    }

    pub fn header(
        name: impl Into<String>,
        value: impl Into<String>,
        pool: impl Into<String>,
    ) -> Self {
        Self::Header {
            name: name.into(),
            value: value.into(),
            pool: pool.into(),
        }
    }

    /// Name of the pool this rule dispatches to.
    pub fn pool(&self) -> &str {
        match self {
            Self::PathPrefix { pool, .. } => pool,
            Self::PathRegex { pool, .. } => pool,
            Self::Header { pool, .. } => pool,
        }
    }

    /// The declared pattern, for the stats surface.
    pub fn pattern(&self) -> String {
        match self {
            Self::PathPrefix { prefix, .. } => prefix.clone(),
            Self::PathRegex { pattern, .. } => pattern.clone(),
            Self::Header { name, value, .. } => format!("{name}: {value}"),
        }
    }

    fn matches(&self, ctx: &RequestContext<'_>) -> bool {
        match self {
            Self::PathPrefix { prefix, .. } => ctx.path.starts_with(prefix.as_str()),
            Self::PathRegex { regex, .. } => regex.is_match(ctx.path),
            Self::Header { name, value, .. } => ctx
                .headers
                .get(name)
                .is_some_and(|v| v.as_bytes() == value.as_bytes()),
        }
    }
}

/// Routes requests across a fixed set of pools.
pub struct Router {
    pools: Vec<BackendPool>,
    rules: Vec<(RouteRule, usize)>,
    default_pool: usize,
}

impl Router {
    /// Builds a router over `pools`, validating that every rule and the
    /// default name resolve to a declared pool.
    pub fn new(pools: Vec<BackendPool>, rules: Vec<RouteRule>, default_pool: &str) -> Result<Self> {
        let default_index = pools
            .iter()
            .position(|p| p.name() == default_pool)
            .ok_or_else(|| {
                ProxyError::InvalidConfig(format!("default backend pool {default_pool} not found"))
            })?;

        let mut resolved = Vec::with_capacity(rules.len());
        for rule in rules {
            let index = pools
                .iter()
                .position(|p| p.name() == rule.pool())
                .ok_or_else(|| {
                    ProxyError::InvalidConfig(format!(
                        "route references unknown backend pool {}",
                        rule.pool()
                    ))
                })?;
            resolved.push((rule, index));
        }

        Ok(Self {
            pools,
            rules: resolved,
            default_pool: default_index,
        })
    }

    /// A passthrough router over a single pool.
    pub fn single(pool: BackendPool) -> Self {
        Self {
            pools: vec![pool],
            rules: Vec::new(),
            default_pool: 0,
        }
    }

    /// Picks the pool for a request: first matching rule, else default.
    pub fn route(&self, ctx: &RequestContext<'_>) -> &BackendPool {
        for (rule, index) in &self.rules {
            if rule.matches(ctx) {
                debug!(pool = %self.pools[*index].name(), pattern = %rule.pattern(), "route matched");
                return &self.pools[*index];
            }
        }
        &self.pools[self.default_pool]
    }

    pub fn pools(&self) -> &[BackendPool] {
        &self.pools
    }

    pub fn default_pool(&self) -> &BackendPool {
        &self.pools[self.default_pool]
    }

    /// Declared rule patterns in evaluation order.
    pub fn route_patterns(&self) -> Vec<String> {
        self.rules.iter().map(|(rule, _)| rule.pattern()).collect()
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }
}
