//! Configuration loading for the load balancer.
//!
//! The configuration is a line-oriented, case-sensitive directive file.
//! Blank lines and `#` comments are ignored. Example:
//!
//! ```text
//! method weighted_round_robin
//! persistence cookie name=GOLB_SESSION ttl=86400
//!
//! upstream backend {
//!     server http://127.0.0.1:9001 weight=5
//!     server http://127.0.0.1:9002 weight=3
//!     server http://127.0.0.1:9003 weight=2
//! }
//!
//! upstream api {
//!     server http://127.0.0.1:9101
//! }
//!
//! route path /api/ api
//! default_backend backend
//! ```
//!
//! Every pool referenced by a route or the default must exist, every
//! regex must compile, and unknown directives are errors; all of that is
//! checked at load time so nothing fails during dispatch.

use crate::error::{ProxyError, Result};
use crate::persistence::{DEFAULT_COOKIE_NAME, DEFAULT_COOKIE_TTL};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Load balancing algorithm applied to every pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl Algorithm {
    /// The directive spelling used in configuration files.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
        }
    }
}

impl FromStr for Algorithm {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" | "weighted-round-robin" | "weighted" => {
                Ok(Self::WeightedRoundRobin)
            }
            "least_connections" | "least-connections" | "least_conn" => Ok(Self::LeastConnections),
            other => Err(ProxyError::InvalidConfig(format!(
                "unknown load balancing method: {other}"
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

/// Session persistence policy applied to every pool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PersistenceConfig {
    #[default]
    None,
    Cookie {
        name: String,
        ttl_seconds: u64,
    },
    IpHash,
    ConsistentHash,
}

impl PersistenceConfig {
    pub fn cookie_defaults() -> Self {
        Self::Cookie {
            name: DEFAULT_COOKIE_NAME.to_string(),
            ttl_seconds: DEFAULT_COOKIE_TTL.as_secs(),
        }
    }

    /// Parses a bare policy name, as given on the command line.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Self::None),
            "cookie" => Ok(Self::cookie_defaults()),
            "ip_hash" => Ok(Self::IpHash),
            "consistent_hash" => Ok(Self::ConsistentHash),
            other => Err(ProxyError::InvalidConfig(format!(
                "unknown persistence method: {other}"
            ))),
        }
    }
}

/// One `server` directive inside an upstream block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub url: String,
    pub weight: u32,
    pub max_conns: u32,
}

/// One named upstream block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub servers: Vec<ServerConfig>,
}

/// One `route` directive, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDirective {
    Path { prefix: String, pool: String },
    Regex { pattern: String, pool: String },
    Header { name: String, value: String, pool: String },
}

impl RouteDirective {
    fn pool(&self) -> &str {
        match self {
            Self::Path { pool, .. } => pool,
            Self::Regex { pool, .. } => pool,
            Self::Header { pool, .. } => pool,
        }
    }
}

/// Fully parsed configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub pools: Vec<PoolConfig>,
    pub method: Algorithm,
    pub persistence: PersistenceConfig,
    pub routes: Vec<RouteDirective>,
    pub default_pool: Option<String>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses and validates configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut cfg = Config::default();
        let mut current_pool: Option<usize> = None;

        for (num, raw) in content.lines().enumerate() {
            let line_num = num + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0] {
                "upstream" => {
                    let name = *parts.get(1).ok_or_else(|| {
                        config_err(line_num, "upstream directive requires a name")
                    })?;
                    let index = match cfg.pools.iter().position(|p| p.name == name) {
                        Some(i) => i,
                        None => {
                            cfg.pools.push(PoolConfig {
                                name: name.to_string(),
                                servers: Vec::new(),
                            });
                            cfg.pools.len() - 1
                        }
                    };
                    current_pool = Some(index);
                }
                "}" => {
                    current_pool = None;
                }
                "server" => {
                    let pool = current_pool.ok_or_else(|| {
                        config_err(line_num, "server directive must be inside an upstream block")
                    })?;
                    let url = *parts
                        .get(1)
                        .ok_or_else(|| config_err(line_num, "server directive requires a URL"))?;
                    let mut server = ServerConfig {
                        url: url.to_string(),
                        weight: 1,
                        max_conns: 0,
                    };
                    for option in &parts[2..] {
                        if let Some(value) = option.strip_prefix("weight=") {
                            server.weight = value.parse().ok().filter(|w| *w >= 1).ok_or_else(
                                || config_err(line_num, &format!("invalid weight: {value}")),
                            )?;
                        } else if let Some(value) = option.strip_prefix("max_conn=") {
                            server.max_conns = value.parse().map_err(|_| {
                                config_err(line_num, &format!("invalid max_conn: {value}"))
                            })?;
                        } else {
                            return Err(config_err(
                                line_num,
                                &format!("unknown server option: {option}"),
                            ));
                        }
                    }
                    cfg.pools[pool].servers.push(server);
                }
                "method" => {
                    let value = *parts
                        .get(1)
                        .ok_or_else(|| config_err(line_num, "method directive requires a value"))?;
                    cfg.method = value
                        .parse()
                        .map_err(|e| config_err(line_num, &format!("{e}")))?;
                }
                "persistence" => {
                    let value = *parts.get(1).ok_or_else(|| {
                        config_err(line_num, "persistence directive requires a method")
                    })?;
                    cfg.persistence = match value {
                        "none" => PersistenceConfig::None,
                        "ip_hash" => PersistenceConfig::IpHash,
                        "consistent_hash" => PersistenceConfig::ConsistentHash,
                        "cookie" => {
                            let mut name = DEFAULT_COOKIE_NAME.to_string();
                            let mut ttl_seconds = DEFAULT_COOKIE_TTL.as_secs();
                            for option in &parts[2..] {
                                if let Some(value) = option.strip_prefix("name=") {
                                    name = value.to_string();
                                } else if let Some(value) = option.strip_prefix("ttl=") {
                                    ttl_seconds = value.parse().map_err(|_| {
                                        config_err(line_num, &format!("invalid ttl: {value}"))
                                    })?;
                                } else {
                                    return Err(config_err(
                                        line_num,
                                        &format!("unknown cookie option: {option}"),
                                    ));
                                }
                            }
                            PersistenceConfig::Cookie { name, ttl_seconds }
                        }
                        other => {
                            return Err(config_err(
                                line_num,
                                &format!("unknown persistence method: {other}"),
                            ))
                        }
                    };
                }
                "route" => {
                    let kind = *parts.get(1).ok_or_else(|| {
                        config_err(line_num, "route directive requires a type")
                    })?;
                    let route = match kind {
                        "path" | "regex" => {
                            let &[pattern, pool] = &parts[2..] else {
                                return Err(config_err(
                                    line_num,
                                    "route directive requires a pattern and a backend pool",
                                ));
                            };
                            if kind == "path" {
                                RouteDirective::Path {
                                    prefix: pattern.to_string(),
                                    pool: pool.to_string(),
                                }
                            } else {
                                RouteDirective::Regex {
                                    pattern: pattern.to_string(),
                                    pool: pool.to_string(),
                                }
                            }
                        }
                        "header" => {
                            let &[name, value, pool] = &parts[2..] else {
                                return Err(config_err(
                                    line_num,
                                    "header route requires a name, a value and a backend pool",
                                ));
                            };
                            RouteDirective::Header {
                                name: name.to_string(),
                                value: value.to_string(),
                                pool: pool.to_string(),
                            }
                        }
                        other => {
                            return Err(config_err(
                                line_num,
                                &format!("unknown route type: {other}"),
                            ))
                        }
                    };
                    cfg.routes.push(route);
                }
                "default_backend" => {
                    let name = *parts.get(1).ok_or_else(|| {
                        config_err(line_num, "default_backend directive requires a pool name")
                    })?;
                    cfg.default_pool = Some(name.to_string());
                }
                other => {
                    return Err(config_err(line_num, &format!("unknown directive: {other}")));
                }
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Emits the canonical text form. `parse(serialize(c))` equals `c`
    /// for every valid configuration.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("method {}\n", self.method.directive()));
        match &self.persistence {
            PersistenceConfig::None => out.push_str("persistence none\n"),
            PersistenceConfig::Cookie { name, ttl_seconds } => {
                out.push_str(&format!("persistence cookie name={name} ttl={ttl_seconds}\n"))
            }
            PersistenceConfig::IpHash => out.push_str("persistence ip_hash\n"),
            PersistenceConfig::ConsistentHash => out.push_str("persistence consistent_hash\n"),
        }
        for pool in &self.pools {
            out.push_str(&format!("\nupstream {} {{\n", pool.name));
            for server in &pool.servers {
                out.push_str(&format!("    server {}", server.url));
                if server.weight != 1 {
                    out.push_str(&format!(" weight={}", server.weight));
                }
                if server.max_conns != 0 {
                    out.push_str(&format!(" max_conn={}", server.max_conns));
                }
                out.push('\n');
            }
            out.push_str("}\n");
        }
        if !self.routes.is_empty() {
            out.push('\n');
        }
        for route in &self.routes {
            match route {
                RouteDirective::Path { prefix, pool } => {
                    out.push_str(&format!("route path {prefix} {pool}\n"))
                }
                RouteDirective::Regex { pattern, pool } => {
                    out.push_str(&format!("route regex {pattern} {pool}\n"))
                }
                RouteDirective::Header { name, value, pool } => {
                    out.push_str(&format!("route header {name} {value} {pool}\n"))
                }
            }
        }
        if let Some(default) = &self.default_pool {
            out.push_str(&format!("default_backend {default}\n"));
        }
        out
    }

    /// Cross-directive validation, run as part of parsing.
    fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "no backend pools defined in configuration".to_string(),
            ));
        }
        for pool in &self.pools {
            if pool.servers.is_empty() {
                return Err(ProxyError::InvalidConfig(format!(
                    "upstream {} declares no servers",
                    pool.name
                )));
            }
        }
        for route in &self.routes {
            if !self.pools.iter().any(|p| p.name == route.pool()) {
                return Err(ProxyError::InvalidConfig(format!(
                    "route references non-existent backend pool: {}",
                    route.pool()
                )));
            }
            if let RouteDirective::Regex { pattern, .. } = route {
                regex::Regex::new(pattern).map_err(|e| {
                    ProxyError::InvalidConfig(format!("invalid regex pattern {pattern}: {e}"))
                })?;
            }
        }
        if let Some(default) = &self.default_pool {
            if !self.pools.iter().any(|p| p.name == *default) {
                return Err(ProxyError::InvalidConfig(format!(
                    "default backend pool not found: {default}"
                )));
            }
        } else if !self.routes.is_empty() && !self.pools.iter().any(|p| p.name == "backend") {
            return Err(ProxyError::InvalidConfig(
                "route directives require a default_backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the default pool: the explicit `default_backend`, else
    /// the pool named `backend`, else the only declared pool.
    pub fn default_pool_name(&self) -> Result<&str> {
        if let Some(default) = &self.default_pool {
            return Ok(default);
        }
        if let Some(pool) = self.pools.iter().find(|p| p.name == "backend") {
            return Ok(&pool.name);
        }
        if self.pools.len() == 1 {
            return Ok(&self.pools[0].name);
        }
        Err(ProxyError::InvalidConfig(
            "no default backend pool could be resolved".to_string(),
        ))
    }
}

fn config_err(line: usize, message: &str) -> ProxyError {
    ProxyError::InvalidConfig(format!("line {line}: {message}"))
}
