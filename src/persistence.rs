//! Session persistence decorators.
//!
//! A persistence policy wraps a base scheduler with the same `choose`
//! capability plus, for cookie persistence, a response-decoration hook.
//! Lookups that miss (no session state, tampered cookie, dead target)
//! fall through to the base scheduler.

use crate::backend::Backend;
use crate::scheduler::{RequestContext, Scheduler, Selection};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default session cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "GOLB_SESSION";

/// Default session cookie lifetime.
pub const DEFAULT_COOKIE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Virtual nodes per unit of weight on the consistent-hash ring.
pub const DEFAULT_RING_REPLICAS: u32 = 100;

/// Sorted ring of `(hash, backend index)` pairs for consistent hashing.
///
/// Built once per pool and immutable afterwards; lookups are a binary
/// search plus a forward walk past dead backends.
#[derive(Debug, Clone)]
pub struct HashRing {
    entries: Vec<(u32, usize)>,
}

impl HashRing {
    /// Builds the ring with `replicas × weight` virtual nodes per
    /// backend, each hashed as `"<url>:<replica>"`.
    pub fn build(backends: &[Arc<Backend>], replicas: u32) -> Self {
        let mut entries = Vec::new();
        for (index, backend) in backends.iter().enumerate() {
            for replica in 0..replicas * backend.weight() {
                let key = format!("{}:{}", backend.url(), replica);
                entries.push((crc32fast::hash(key.as_bytes()), index));
            }
        }
        entries.sort_unstable();
        Self { entries }
    }

    /// Maps a key to the first alive backend at or after its hash,
    /// wrapping around. Walks at most one full revolution.
    pub fn lookup(&self, key: &str, backends: &[Arc<Backend>]) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = crc32fast::hash(key.as_bytes());
        let start = self.entries.partition_point(|(h, _)| *h < hash);
        for offset in 0..self.entries.len() {
            let (_, index) = self.entries[(start + offset) % self.entries.len()];
            if backends[index].is_alive() {
                return Some(index);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runtime state for one pool's persistence policy.
pub enum SessionPolicy {
    None,
    Cookie { name: String, ttl: Duration },
    IpHash { map: DashMap<String, usize> },
    ConsistentHash { ring: HashRing },
}

impl SessionPolicy {
    pub fn ip_hash() -> Self {
        Self::IpHash {
            map: DashMap::new(),
        }
    }

    pub fn consistent_hash(backends: &[Arc<Backend>], replicas: u32) -> Self {
        Self::ConsistentHash {
            ring: HashRing::build(backends, replicas),
        }
    }
}

/// A base scheduler wrapped with an optional persistence policy.
pub struct PersistentScheduler {
    base: Box<dyn Scheduler>,
    policy: SessionPolicy,
}

impl PersistentScheduler {
    pub fn new(base: Box<dyn Scheduler>, policy: SessionPolicy) -> Self {
        Self { base, policy }
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.base.name()
    }

    pub fn policy_name(&self) -> &'static str {
        match self.policy {
            SessionPolicy::None => "None",
            SessionPolicy::Cookie { .. } => "Cookie",
            SessionPolicy::IpHash { .. } => "IP Hash",
            SessionPolicy::ConsistentHash { .. } => "Consistent Hash",
        }
    }

    /// Selects a backend, consulting session state first.
    pub fn choose(&self, backends: &[Arc<Backend>], ctx: &RequestContext<'_>) -> Option<Selection> {
        match &self.policy {
            SessionPolicy::None => self.delegate(backends, ctx),
            SessionPolicy::Cookie { name, .. } => {
                if let Some(index) = self.cookie_target(name, backends, ctx) {
                    return Some(Selection {
                        index,
                        sticky: true,
                    });
                }
                self.delegate(backends, ctx)
            }
            SessionPolicy::IpHash { map } => {
                let Some(ip) = client_ip(ctx) else {
                    // No address to key on; pick fresh and do not remember.
                    return self.delegate(backends, ctx);
                };
                if let Some(entry) = map.get(&ip) {
                    let index = *entry;
                    if index < backends.len() && backends[index].is_alive() {
                        return Some(Selection {
                            index,
                            sticky: true,
                        });
                    }
                }
                let selection = self.delegate(backends, ctx)?;
                map.insert(ip, selection.index);
                Some(selection)
            }
            SessionPolicy::ConsistentHash { ring } => {
                if ctx.path.is_empty() {
                    return self.delegate(backends, ctx);
                }
                ring.lookup(ctx.path, backends).map(|index| Selection {
                    index,
                    sticky: true,
                })
            }
        }
    }

    /// The `Set-Cookie` value to attach for a fresh (non-sticky) cookie
    /// selection. `None` for every other policy or for sticky hits.
    pub fn session_cookie(
        &self,
        backends: &[Arc<Backend>],
        selection: &Selection,
        ctx: &RequestContext<'_>,
    ) -> Option<http::HeaderValue> {
        let SessionPolicy::Cookie { name, ttl } = &self.policy else {
            return None;
        };
        if selection.sticky {
            return None;
        }
        let backend = backends.get(selection.index)?;
        let mut cookie = format!(
            "{}={}:{}; Path=/; HttpOnly; Max-Age={}",
            name,
            selection.index,
            url_fingerprint(backend),
            ttl.as_secs()
        );
        if ctx.tls {
            cookie.push_str("; Secure");
        }
        http::HeaderValue::from_str(&cookie).ok()
    }

    fn delegate(&self, backends: &[Arc<Backend>], ctx: &RequestContext<'_>) -> Option<Selection> {
        self.base.choose(backends, ctx).map(|index| Selection {
            index,
            sticky: false,
        })
    }

    /// Resolves a session cookie to a backend index. Malformed values,
    /// out-of-range indices, fingerprint mismatches and dead targets all
    /// read as absence.
    fn cookie_target(
        &self,
        name: &str,
        backends: &[Arc<Backend>],
        ctx: &RequestContext<'_>,
    ) -> Option<usize> {
        let value = cookie_value(ctx.headers, name)?;
        let (index, fingerprint) = value.split_once(':')?;
        let index: usize = index.parse().ok()?;
        let backend = backends.get(index)?;
        if !url_fingerprint(backend).eq_ignore_ascii_case(fingerprint) {
            debug!(cookie = name, "session cookie fingerprint mismatch");
            return None;
        }
        if !backend.is_alive() {
            return None;
        }
        Some(index)
    }
}

fn url_fingerprint(backend: &Backend) -> String {
    format!("{:x}", md5::compute(backend.url().as_str()))
}

/// Finds a cookie by name across all `Cookie` headers.
fn cookie_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    for header in headers.get_all(http::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Client address for IP-hash persistence: first `X-Forwarded-For`
/// token when present, else the transport peer address.
fn client_ip(ctx: &RequestContext<'_>) -> Option<String> {
    if let Some(forwarded) = ctx
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    ctx.peer_addr.map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HealthPolicy;
    use crate::scheduler::{tests::make_backends, RoundRobin};
    use http::{HeaderMap, HeaderValue, Method};

    fn rr() -> Box<dyn Scheduler> {
        Box::new(RoundRobin::new())
    }

    fn request_ctx<'a>(
        method: &'a Method,
        headers: &'a HeaderMap,
        peer: Option<std::net::SocketAddr>,
    ) -> RequestContext<'a> {
        RequestContext {
            method,
            path: "/",
            headers,
            peer_addr: peer,
            tls: false,
        }
    }

    fn kill(backend: &Arc<Backend>) {
        backend.record_failure(&HealthPolicy {
            failure_threshold: 1,
            revival_cooldown: Duration::from_secs(600),
        });
    }

    #[test]
    fn test_cookie_round_trip() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::Cookie {
                name: DEFAULT_COOKIE_NAME.to_string(),
                ttl: DEFAULT_COOKIE_TTL,
            },
        );

        let method = Method::GET;
        let headers = HeaderMap::new();
        let ctx = request_ctx(&method, &headers, None);

        let first = sched.choose(&backends, &ctx).unwrap();
        assert!(!first.sticky);
        let cookie = sched.session_cookie(&backends, &first, &ctx).unwrap();
        let cookie = cookie.to_str().unwrap().to_string();
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));

        // Replay the cookie: every subsequent choice is the same backend.
        let value = cookie
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let mut replay = HeaderMap::new();
        replay.insert(http::header::COOKIE, HeaderValue::from_str(&value).unwrap());
        let ctx = request_ctx(&method, &replay, None);
        for _ in 0..10 {
            let sel = sched.choose(&backends, &ctx).unwrap();
            assert!(sel.sticky);
            assert_eq!(sel.index, first.index);
            // Sticky hits never re-set the cookie.
            assert!(sched.session_cookie(&backends, &sel, &ctx).is_none());
        }
    }

    #[test]
    fn test_cookie_secure_over_tls() {
        let backends = make_backends(&[1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::Cookie {
                name: DEFAULT_COOKIE_NAME.to_string(),
                ttl: Duration::from_secs(60),
            },
        );
        let method = Method::GET;
        let headers = HeaderMap::new();
        let mut ctx = request_ctx(&method, &headers, None);
        ctx.tls = true;

        let sel = sched.choose(&backends, &ctx).unwrap();
        let cookie = sched.session_cookie(&backends, &sel, &ctx).unwrap();
        assert!(cookie.to_str().unwrap().contains("Secure"));
        assert!(cookie.to_str().unwrap().contains("Max-Age=60"));
    }

    #[test]
    fn test_tampered_cookie_falls_through() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::Cookie {
                name: DEFAULT_COOKIE_NAME.to_string(),
                ttl: DEFAULT_COOKIE_TTL,
            },
        );
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("GOLB_SESSION=1:00000000000000000000000000000000"),
        );
        let ctx = request_ctx(&method, &headers, None);

        // Fingerprint mismatch reads as cookie absence.
        let sel = sched.choose(&backends, &ctx).unwrap();
        assert!(!sel.sticky);
    }

    #[test]
    fn test_out_of_range_cookie_falls_through() {
        let backends = make_backends(&[1, 1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::Cookie {
                name: DEFAULT_COOKIE_NAME.to_string(),
                ttl: DEFAULT_COOKIE_TTL,
            },
        );
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("GOLB_SESSION=9:deadbeef"),
        );
        let ctx = request_ctx(&method, &headers, None);
        assert!(!sched.choose(&backends, &ctx).unwrap().sticky);
    }

    #[tokio::test]
    async fn test_cookie_dead_target_falls_through() {
        let backends = make_backends(&[1, 1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::Cookie {
                name: DEFAULT_COOKIE_NAME.to_string(),
                ttl: DEFAULT_COOKIE_TTL,
            },
        );
        let value = format!("GOLB_SESSION=0:{}", url_fingerprint(&backends[0]));
        kill(&backends[0]);

        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_str(&value).unwrap());
        let ctx = request_ctx(&method, &headers, None);

        let sel = sched.choose(&backends, &ctx).unwrap();
        assert!(!sel.sticky);
        assert_eq!(sel.index, 1);
    }

    #[test]
    fn test_ip_hash_sticks_per_forwarded_ip() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(rr(), SessionPolicy::ip_hash());
        let method = Method::GET;

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.2.3"));
        let ctx = request_ctx(&method, &headers, None);

        let first = sched.choose(&backends, &ctx).unwrap();
        for _ in 0..10 {
            let sel = sched.choose(&backends, &ctx).unwrap();
            assert_eq!(sel.index, first.index);
            assert!(sel.sticky);
        }
    }

    #[test]
    fn test_ip_hash_takes_first_forwarded_token() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(rr(), SessionPolicy::ip_hash());
        let method = Method::GET;

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        let ctx = request_ctx(&method, &headers, None);
        let first = sched.choose(&backends, &ctx).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 192.168.9.9"),
        );
        let ctx = request_ctx(&method, &headers, None);
        let again = sched.choose(&backends, &ctx).unwrap();
        assert_eq!(again.index, first.index);
    }

    #[test]
    fn test_ip_hash_falls_back_to_peer_addr() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(rr(), SessionPolicy::ip_hash());
        let method = Method::GET;
        let headers = HeaderMap::new();
        let peer: std::net::SocketAddr = "10.9.8.7:40000".parse().unwrap();
        let ctx = request_ctx(&method, &headers, Some(peer));

        let first = sched.choose(&backends, &ctx).unwrap();
        // Same host, different ephemeral port: still the same session.
        let peer: std::net::SocketAddr = "10.9.8.7:40001".parse().unwrap();
        let ctx = request_ctx(&method, &headers, Some(peer));
        assert_eq!(sched.choose(&backends, &ctx).unwrap().index, first.index);
    }

    #[test]
    fn test_ip_hash_without_address_does_not_remember() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(rr(), SessionPolicy::ip_hash());
        let method = Method::GET;
        let headers = HeaderMap::new();
        let ctx = request_ctx(&method, &headers, None);

        // Anonymous requests rotate through the base scheduler.
        let a = sched.choose(&backends, &ctx).unwrap();
        let b = sched.choose(&backends, &ctx).unwrap();
        assert!(!a.sticky && !b.sticky);
        assert_ne!(a.index, b.index);
    }

    #[tokio::test]
    async fn test_ip_hash_remaps_when_target_dies() {
        let backends = make_backends(&[1, 1, 1]);
        let sched = PersistentScheduler::new(rr(), SessionPolicy::ip_hash());
        let method = Method::GET;
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.5"));
        let ctx = request_ctx(&method, &headers, None);

        let first = sched.choose(&backends, &ctx).unwrap();
        kill(&backends[first.index]);

        let second = sched.choose(&backends, &ctx).unwrap();
        assert_ne!(second.index, first.index);
        // The fresh mapping sticks from now on.
        assert_eq!(sched.choose(&backends, &ctx).unwrap().index, second.index);
    }

    #[test]
    fn test_hash_ring_deterministic_lookup() {
        let backends = make_backends(&[1, 1, 1]);
        let ring = HashRing::build(&backends, DEFAULT_RING_REPLICAS);
        assert_eq!(ring.len(), 300);

        let a = ring.lookup("/products", &backends);
        for _ in 0..20 {
            assert_eq!(ring.lookup("/products", &backends), a);
        }
    }

    #[test]
    fn test_hash_ring_spreads_keys() {
        let backends = make_backends(&[1, 1, 1]);
        let ring = HashRing::build(&backends, DEFAULT_RING_REPLICAS);

        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let path = format!("/resource/{i}");
            seen.insert(ring.lookup(&path, &backends).unwrap());
        }
        assert!(seen.len() >= 2);
    }

    #[tokio::test]
    async fn test_hash_ring_walks_past_dead_backend() {
        let backends = make_backends(&[1, 1, 1]);
        let ring = HashRing::build(&backends, DEFAULT_RING_REPLICAS);

        let home = ring.lookup("/orders", &backends).unwrap();
        kill(&backends[home]);

        let rerouted = ring.lookup("/orders", &backends).unwrap();
        assert_ne!(rerouted, home);
        // Stable while the topology holds.
        assert_eq!(ring.lookup("/orders", &backends), Some(rerouted));
    }

    #[tokio::test]
    async fn test_hash_ring_all_dead() {
        let backends = make_backends(&[1, 1]);
        let ring = HashRing::build(&backends, 10);
        kill(&backends[0]);
        kill(&backends[1]);
        assert_eq!(ring.lookup("/x", &backends), None);
    }

    #[test]
    fn test_consistent_hash_empty_path_delegates() {
        let backends = make_backends(&[1, 1]);
        let sched = PersistentScheduler::new(
            rr(),
            SessionPolicy::consistent_hash(&backends, DEFAULT_RING_REPLICAS),
        );
        let method = Method::GET;
        let headers = HeaderMap::new();
        let mut ctx = request_ctx(&method, &headers, None);
        ctx.path = "";
        assert!(!sched.choose(&backends, &ctx).unwrap().sticky);
    }

    #[test]
    fn test_ring_weight_scales_virtual_nodes() {
        let backends = make_backends(&[3, 1]);
        let ring = HashRing::build(&backends, 100);
        assert_eq!(ring.len(), 400);
    }
}
