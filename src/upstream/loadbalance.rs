pub mod ip_hash;
pub mod least_conn;
pub mod random;
pub mod round_robin;
pub mod weighted;

use crate::config::TargetConfig;
use ip_hash::IpHashBalancer;
use least_conn::LeastConnBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use weighted::WeightedBalancer;

/// One backend endpoint with its live per-request state. Cheap to clone —
/// the health flag and the active-connection gauge are shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    healthy: Arc<AtomicBool>,
    active_conns: Arc<AtomicUsize>,
    /// Pre-computed "host:port" string — avoids a `format!()` allocation
    /// on every breaker lookup, health probe, and log line.
    endpoint: Arc<str>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        let host = host.into();
        let endpoint: Arc<str> = format!("{}:{}", host, port).into();
        Self {
            host,
            port,
            weight,
            healthy: Arc::new(AtomicBool::new(true)),
            active_conns: Arc::new(AtomicUsize::new(0)),
            endpoint,
        }
    }

    /// Returns the cached "host:port" string. Zero allocation.
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_active(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_active(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

impl From<&TargetConfig> for Target {
    fn from(cfg: &TargetConfig) -> Self {
        Target::new(cfg.host.clone(), cfg.port, cfg.weight)
    }
}

/// RAII guard for a target's active-connection slot. Acquired on
/// selection, released on drop — every exit path of a forwarded request
/// (success, error, timeout, client abort) decrements the gauge.
pub struct ConnGuard {
    target: Target,
}

impl ConnGuard {
    pub fn acquire(target: &Target) -> Self {
        target.inc_active();
        Self {
            target: target.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.target.endpoint()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.target.dec_active();
    }
}

/// Enum-based load balancer — no trait objects, no dynamic dispatch.
///
/// Selection operates on the per-request candidate slice (targets that are
/// healthy and whose circuit breaker admits traffic), so cursors index into
/// the live healthy set rather than the configured list.
pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    LeastConn(LeastConnBalancer),
    IpHash(IpHashBalancer),
    Weighted(WeightedBalancer),
    Random(RandomBalancer),
}

impl LoadBalancer {
    pub fn new(algorithm: &str) -> Arc<Self> {
        match algorithm {
            "least-connections" => Arc::new(Self::LeastConn(LeastConnBalancer::new())),
            "ip-hash" => Arc::new(Self::IpHash(IpHashBalancer::new())),
            "weighted" => Arc::new(Self::Weighted(WeightedBalancer::new())),
            "random" => Arc::new(Self::Random(RandomBalancer::new())),
            _ => Arc::new(Self::RoundRobin(RoundRobinBalancer::new())),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::RoundRobin(_) => "round-robin",
            Self::LeastConn(_) => "least-connections",
            Self::IpHash(_) => "ip-hash",
            Self::Weighted(_) => "weighted",
            Self::Random(_) => "random",
        }
    }

    /// Pick one target out of `candidates`. Returns `None` when the
    /// candidate set is empty (or, for the weighted balancer, when every
    /// candidate has weight zero).
    pub fn select(&self, candidates: &[Target], client_ip: IpAddr) -> Option<Target> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin(lb) => lb.do_select(candidates),
            Self::LeastConn(lb) => lb.do_select(candidates),
            Self::IpHash(lb) => lb.do_select(candidates, client_ip),
            Self::Weighted(lb) => lb.do_select(candidates),
            Self::Random(lb) => lb.do_select(candidates),
        }
    }
}
