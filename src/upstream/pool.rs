use crate::config::{KeepalivePoolConfig, TargetConfig, UpstreamConfig};
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use crate::upstream::circuit_breaker::CircuitBreaker;
use crate::upstream::loadbalance::{ConnGuard, LoadBalancer, Target};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Consecutive probe streaks for one endpoint. Both counters reset on a
/// health-state transition.
struct ProbeCounters {
    successes: AtomicU32,
    failures: AtomicU32,
}

impl Default for ProbeCounters {
    fn default() -> Self {
        Self {
            successes: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }
}

/// Retry policy snapshot handed to the forwarder.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_on_status: Vec<u16>,
}

/// Runtime representation of an upstream pool — owns all per-pool state.
///
/// `UpstreamConfig` is the pure serde description of *what* the pool
/// should look like; `Upstream` holds the mutable runtime side: live
/// targets, load balancer, circuit breakers, probe streaks, and the
/// pooled HTTP client used to reach the targets.
#[derive(Clone)]
pub struct Upstream {
    config: Arc<UpstreamConfig>,
    targets: Arc<ArcSwap<Vec<Target>>>,
    lb: Arc<LoadBalancer>,
    /// One breaker per live endpoint, created lazily from the pool's
    /// breaker config (no-op breakers when the config is absent).
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    probes: Arc<DashMap<String, ProbeCounters>>,
    http_client: Client<HttpConnector, BoxBody>,
    health_cancel: CancellationToken,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Self {
        let lb = LoadBalancer::new(&config.algorithm);
        let targets: Vec<Target> = config.targets.iter().map(Target::from).collect();
        let http_client = build_upstream_http_client(&config.keepalive_pool, config.timeout.connect);

        Self {
            config: Arc::new(config),
            targets: Arc::new(ArcSwap::from_pointee(targets)),
            lb,
            breakers: Arc::new(DashMap::new()),
            probes: Arc::new(DashMap::new()),
            http_client,
            health_cancel: CancellationToken::new(),
        }
    }

    // ---- Accessors ----

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn http_client(&self) -> &Client<HttpConnector, BoxBody> {
        &self.http_client
    }

    pub fn targets(&self) -> Arc<Vec<Target>> {
        self.targets.load_full()
    }

    pub fn health_token(&self) -> CancellationToken {
        self.health_cancel.clone()
    }

    /// The breaker guarding `endpoint`, created on first use.
    fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        // Fast path: entry already exists — no key allocation.
        if let Some(entry) = self.breakers.get(endpoint) {
            return entry.value().clone();
        }
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_config(
                    self.config.circuit_breaker.as_ref(),
                ))
            })
            .clone()
    }

    /// Circuit state for the admin health listing. Endpoints with no
    /// breaker activity yet read as "closed".
    pub fn circuit_state(&self, endpoint: &str) -> &'static str {
        self.breakers
            .get(endpoint)
            .map(|b| b.state_name())
            .unwrap_or("closed")
    }

    pub fn retry_plan(&self) -> RetryPlan {
        match &self.config.retry {
            Some(r) => RetryPlan {
                enabled: r.enabled,
                max_retries: r.max_retries,
                retry_on_status: r.retry_on_status.clone(),
            },
            None => RetryPlan {
                enabled: false,
                max_retries: 0,
                retry_on_status: Vec::new(),
            },
        }
    }

    // ---- Selection ----

    /// Pick a target that is healthy, not excluded, and admitted by its
    /// circuit breaker; acquire its active-connection slot. Targets whose
    /// breaker rejects are skipped and selection re-runs over the rest.
    ///
    /// Breakers are consulted only on the balancer's pick, never during
    /// candidate filtering, so an Open breaker's probe slot is not burned
    /// on targets that were not going to be selected.
    pub fn select(
        &self,
        client_ip: IpAddr,
        exclude: &[String],
    ) -> Result<(Target, ConnGuard), GatewayError> {
        let targets = self.targets.load();
        let mut rejected: Vec<String> = Vec::new();

        for _ in 0..targets.len() {
            let candidates: Vec<Target> = targets
                .iter()
                .filter(|t| {
                    t.is_healthy()
                        && !exclude.iter().any(|e| e == t.endpoint())
                        && !rejected.iter().any(|e| e == t.endpoint())
                })
                .cloned()
                .collect();

            let Some(target) = self.lb.select(&candidates, client_ip) else {
                break;
            };

            if !self.breaker(target.endpoint()).allow() {
                tracing::debug!(
                    "upstream: circuit open, skipping target, upstream={}, target={}",
                    self.name(),
                    target.endpoint()
                );
                metrics::counter!(
                    "gateway_circuit_breaker_rejected_total",
                    "upstream" => self.name().to_owned(),
                    "target" => target.endpoint().to_owned(),
                )
                .increment(1);
                rejected.push(target.endpoint().to_owned());
                continue;
            }

            let guard = ConnGuard::acquire(&target);
            return Ok((target, guard));
        }

        // Distinguish an empty/unhealthy pool from one emptied by open
        // circuits; both surface to the client as 503.
        if rejected.is_empty() {
            Err(GatewayError::NoHealthyTarget)
        } else {
            Err(GatewayError::CircuitOpen)
        }
    }

    /// Feed a forwarding outcome into the target's circuit breaker.
    pub fn report(&self, endpoint: &str, success: bool) {
        let breaker = self.breaker(endpoint);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    // ---- Active health probe bookkeeping ----

    pub fn record_probe_success(&self, endpoint: &str, healthy_threshold: u32) {
        let entry = self.probes.entry(endpoint.to_string()).or_default();
        entry.failures.store(0, Ordering::Relaxed);
        let streak = entry.successes.fetch_add(1, Ordering::Relaxed) + 1;
        drop(entry);

        if streak >= healthy_threshold {
            if let Some(target) = self.find_target(endpoint) {
                if !target.is_healthy() {
                    target.set_healthy(true);
                    self.reset_probe_counters(endpoint);
                    metrics::gauge!(
                        "gateway_upstream_health_status",
                        "upstream" => self.name().to_owned(),
                        "target" => endpoint.to_owned(),
                    )
                    .set(1.0);
                    tracing::info!(
                        "health: target recovered, upstream={}, target={}, streak={}",
                        self.name(),
                        endpoint,
                        streak
                    );
                }
            }
        }
    }

    pub fn record_probe_failure(&self, endpoint: &str, unhealthy_threshold: u32) {
        let entry = self.probes.entry(endpoint.to_string()).or_default();
        entry.successes.store(0, Ordering::Relaxed);
        let streak = entry.failures.fetch_add(1, Ordering::Relaxed) + 1;
        drop(entry);

        if streak >= unhealthy_threshold {
            if let Some(target) = self.find_target(endpoint) {
                if target.is_healthy() {
                    target.set_healthy(false);
                    self.reset_probe_counters(endpoint);
                    metrics::gauge!(
                        "gateway_upstream_health_status",
                        "upstream" => self.name().to_owned(),
                        "target" => endpoint.to_owned(),
                    )
                    .set(0.0);
                    tracing::warn!(
                        "health: target marked unhealthy, upstream={}, target={}, streak={}",
                        self.name(),
                        endpoint,
                        streak
                    );
                }
            }
        }
    }

    fn reset_probe_counters(&self, endpoint: &str) {
        if let Some(entry) = self.probes.get(endpoint) {
            entry.successes.store(0, Ordering::Relaxed);
            entry.failures.store(0, Ordering::Relaxed);
        }
    }

    fn find_target(&self, endpoint: &str) -> Option<Target> {
        self.targets
            .load()
            .iter()
            .find(|t| t.endpoint() == endpoint)
            .cloned()
    }

    // ---- Config update ----

    /// Apply a new config while preserving runtime state: targets keep
    /// their health flags and active-conn gauges when the endpoint is
    /// unchanged, breaker and probe state survives, and the balancer is
    /// rebuilt only when the algorithm changed.
    pub fn update_config(&self, new_config: UpstreamConfig) -> Self {
        let new_lb = if new_config.algorithm != self.config.algorithm {
            LoadBalancer::new(&new_config.algorithm)
        } else {
            self.lb.clone()
        };

        let old_targets = self.targets.load();
        let merged: Vec<Target> = new_config
            .targets
            .iter()
            .map(|cfg| {
                let endpoint = format!("{}:{}", cfg.host, cfg.port);
                match old_targets.iter().find(|t| t.endpoint() == endpoint) {
                    // Same endpoint — keep live state, adopt the new weight.
                    Some(existing) if existing.weight == cfg.weight => existing.clone(),
                    Some(existing) => {
                        let mut t = existing.clone();
                        t.weight = cfg.weight;
                        t
                    }
                    None => Target::from(cfg),
                }
            })
            .collect();

        let new_client = if new_config.keepalive_pool != self.config.keepalive_pool
            || new_config.timeout.connect != self.config.timeout.connect
        {
            build_upstream_http_client(&new_config.keepalive_pool, new_config.timeout.connect)
        } else {
            self.http_client.clone()
        };

        let updated = Self {
            config: Arc::new(new_config),
            targets: Arc::new(ArcSwap::from_pointee(merged)),
            lb: new_lb,
            breakers: self.breakers.clone(),
            probes: self.probes.clone(),
            http_client: new_client,
            health_cancel: CancellationToken::new(),
        };
        updated.purge_stale_endpoints();
        updated
    }

    /// Drop breaker and probe entries for endpoints no longer configured.
    fn purge_stale_endpoints(&self) {
        let active: HashSet<String> = self
            .targets
            .load()
            .iter()
            .map(|t| t.endpoint().to_owned())
            .collect();
        self.probes.retain(|k, _| active.contains(k));
        self.breakers.retain(|k, _| active.contains(k));
    }
}

/// Central registry of all live upstreams. Thread-safe, cheaply cloneable.
/// Admin mutations land here and are observed by the next request.
#[derive(Clone)]
pub struct UpstreamStore {
    upstreams: Arc<DashMap<String, Upstream>>,
    probe_client: reqwest::Client,
}

impl Default for UpstreamStore {
    fn default() -> Self {
        Self {
            upstreams: Arc::new(DashMap::new()),
            probe_client: super::health::build_probe_client(),
        }
    }
}

impl UpstreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Upstream> {
        self.upstreams.get(name).map(|e| e.value().clone())
    }

    /// Upsert an upstream. An existing entry keeps its runtime state; its
    /// health-checker task is restarted against the new config.
    pub fn upsert(&self, config: UpstreamConfig) {
        let name = config.name.clone();
        let upstream = if let Some(existing) = self.get(&name) {
            existing.health_token().cancel();
            existing.update_config(config)
        } else {
            Upstream::new(config)
        };
        super::health::spawn_health_checker(upstream.clone(), self.probe_client.clone());
        self.upstreams.insert(name, upstream);
    }

    /// Remove an upstream, stopping its health checker.
    pub fn remove(&self, name: &str) -> bool {
        match self.upstreams.remove(name) {
            Some((_, upstream)) => {
                upstream.health_token().cancel();
                true
            }
            None => false,
        }
    }

    /// Append a target to an existing upstream. Returns `false` when the
    /// upstream does not exist.
    pub fn add_target(&self, name: &str, target: TargetConfig) -> bool {
        let Some(existing) = self.get(name) else {
            return false;
        };
        let mut config = existing.config().clone();
        config.targets.push(target);
        self.upsert(config);
        true
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Upstream)) {
        for entry in self.upstreams.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn init_from_configs(&self, configs: &[UpstreamConfig]) {
        for config in configs {
            self.upsert(config.clone());
        }
    }

    /// Cancel every upstream's health-checker task (shutdown path).
    pub fn shutdown(&self) {
        for entry in self.upstreams.iter() {
            entry.value().health_token().cancel();
        }
    }
}

/// Build a pooled hyper client for one upstream. Plain HTTP — the gateway
/// forwards over `http` and leaves TLS to the edge in front of it.
fn build_upstream_http_client(
    pool_cfg: &KeepalivePoolConfig,
    connect_timeout_secs: f64,
) -> Client<HttpConnector, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(pool_cfg.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(connect_timeout_secs)));

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool_cfg.idle_timeout))
        .pool_max_idle_per_host(pool_cfg.size)
        .build(http)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};

    fn target_cfg(host: &str, port: u16, weight: u32) -> TargetConfig {
        TargetConfig {
            host: host.to_string(),
            port,
            weight,
        }
    }

    fn upstream_cfg(name: &str, targets: Vec<TargetConfig>) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            algorithm: "round-robin".to_string(),
            targets,
            ..UpstreamConfig::default()
        }
    }

    fn client_ip() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_select_round_robin_alternates() {
        let up = Upstream::new(upstream_cfg(
            "u",
            vec![target_cfg("t1", 80, 1), target_cfg("t2", 80, 1)],
        ));
        let order: Vec<String> = (0..6)
            .map(|_| {
                let (t, guard) = up.select(client_ip(), &[]).unwrap();
                drop(guard);
                t.host
            })
            .collect();
        assert_eq!(order, vec!["t1", "t2", "t1", "t2", "t1", "t2"]);
    }

    #[tokio::test]
    async fn test_select_skips_unhealthy() {
        let up = Upstream::new(upstream_cfg(
            "u",
            vec![target_cfg("a", 80, 1), target_cfg("b", 80, 1)],
        ));
        up.targets()
            .iter()
            .find(|t| t.host == "a")
            .unwrap()
            .set_healthy(false);

        for _ in 0..10 {
            let (t, _guard) = up.select(client_ip(), &[]).unwrap();
            assert_eq!(t.host, "b");
        }
    }

    #[tokio::test]
    async fn test_select_empty_pool() {
        let up = Upstream::new(upstream_cfg("u", vec![]));
        assert!(matches!(
            up.select(client_ip(), &[]),
            Err(GatewayError::NoHealthyTarget)
        ));
    }

    #[tokio::test]
    async fn test_select_never_returns_open_circuit() {
        let mut cfg = upstream_cfg("u", vec![target_cfg("a", 80, 1), target_cfg("b", 80, 1)]);
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 3600,
        });
        let up = Upstream::new(cfg);

        up.report("a:80", false); // trips a's breaker

        for _ in 0..10 {
            let (t, _guard) = up.select(client_ip(), &[]).unwrap();
            assert_eq!(t.endpoint(), "b:80");
        }
    }

    #[tokio::test]
    async fn test_select_all_circuits_open() {
        let mut cfg = upstream_cfg("u", vec![target_cfg("a", 80, 1)]);
        cfg.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 3600,
        });
        let up = Upstream::new(cfg);
        up.report("a:80", false);

        assert!(matches!(
            up.select(client_ip(), &[]),
            Err(GatewayError::CircuitOpen)
        ));
        assert_eq!(up.circuit_state("a:80"), "open");
    }

    #[tokio::test]
    async fn test_select_respects_exclusions() {
        let up = Upstream::new(upstream_cfg(
            "u",
            vec![target_cfg("a", 80, 1), target_cfg("b", 80, 1)],
        ));
        let exclude = vec!["a:80".to_string()];
        for _ in 0..5 {
            let (t, _guard) = up.select(client_ip(), &exclude).unwrap();
            assert_eq!(t.endpoint(), "b:80");
        }
    }

    #[tokio::test]
    async fn test_guard_releases_active_conn() {
        let up = Upstream::new(upstream_cfg("u", vec![target_cfg("a", 80, 1)]));
        let (t, guard) = up.select(client_ip(), &[]).unwrap();
        assert_eq!(t.active_conns(), 1);
        drop(guard);
        assert_eq!(t.active_conns(), 0);
    }

    #[tokio::test]
    async fn test_probe_transitions() {
        let up = Upstream::new(upstream_cfg("u", vec![target_cfg("a", 80, 1)]));

        up.record_probe_failure("a:80", 2);
        assert!(up.find_target("a:80").unwrap().is_healthy());
        up.record_probe_failure("a:80", 2);
        assert!(!up.find_target("a:80").unwrap().is_healthy());

        // One success is not enough with threshold 2; a failure in between
        // resets the success streak.
        up.record_probe_success("a:80", 2);
        assert!(!up.find_target("a:80").unwrap().is_healthy());
        up.record_probe_failure("a:80", 5);
        up.record_probe_success("a:80", 2);
        assert!(!up.find_target("a:80").unwrap().is_healthy());
        up.record_probe_success("a:80", 2);
        assert!(up.find_target("a:80").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_update_config_preserves_target_state() {
        let up = Upstream::new(upstream_cfg(
            "u",
            vec![target_cfg("a", 80, 1), target_cfg("b", 80, 1)],
        ));
        up.find_target("a:80").unwrap().set_healthy(false);

        let updated = up.update_config(upstream_cfg(
            "u",
            vec![target_cfg("a", 80, 1), target_cfg("c", 80, 1)],
        ));

        // a kept its health flag, b is gone, c starts healthy.
        assert!(!updated.find_target("a:80").unwrap().is_healthy());
        assert!(updated.find_target("b:80").is_none());
        assert!(updated.find_target("c:80").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_retry_plan_defaults() {
        let up = Upstream::new(upstream_cfg("u", vec![]));
        let plan = up.retry_plan();
        assert!(!plan.enabled);
        assert_eq!(plan.max_retries, 0);

        let mut cfg = upstream_cfg("u2", vec![]);
        cfg.retry = Some(RetryConfig {
            enabled: true,
            max_retries: 2,
            retry_on_status: vec![500, 503],
        });
        let up = Upstream::new(cfg);
        let plan = up.retry_plan();
        assert!(plan.enabled);
        assert_eq!(plan.max_retries, 2);
        assert_eq!(plan.retry_on_status, vec![500, 503]);
    }

    #[tokio::test]
    async fn test_store_crud() {
        let store = UpstreamStore::new();
        store.upsert(upstream_cfg("users", vec![target_cfg("a", 80, 1)]));

        assert!(store.get("users").is_some());
        assert!(store.add_target("users", target_cfg("b", 80, 1)));
        assert_eq!(store.get("users").unwrap().targets().len(), 2);

        assert!(!store.add_target("ghost", target_cfg("x", 80, 1)));
        assert!(store.remove("users"));
        assert!(!store.remove("users"));
        assert!(store.get("users").is_none());
    }
}
