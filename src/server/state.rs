use crate::config::{GatewayConfig, TargetConfig, UpstreamConfig};
use crate::metrics::Metrics;
use crate::plugins::Registry;
use crate::routing::Router;
use crate::upstream::UpstreamStore;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Reads on the request path go through lock-free snapshots (`ArcSwap`
/// router/config, `DashMap`-backed upstream store). All admin mutations
/// are serialized through `config_mu` so concurrent read-modify-write
/// cannot lose updates; the next incoming request observes the result.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub router: Arc<ArcSwap<Router>>,
    pub upstreams: UpstreamStore,
    pub registry: Arc<Registry>,
    pub metrics: Metrics,
    admin_inline: bool,
    config_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    /// Build the full runtime state from a validated config document.
    /// Route compilation parses every plugin's options, so a bad document
    /// fails here — at load time — rather than on a live request.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let router = Router::build(&config.services, &config.plugins, &registry)?;

        let upstreams = UpstreamStore::new();
        upstreams.init_from_configs(&config.upstreams);

        let metrics = Metrics::install();
        let admin_inline = config.gateway.admin_port.is_none();

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            router: Arc::new(ArcSwap::from_pointee(router)),
            upstreams,
            registry,
            metrics,
            admin_inline,
            config_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Whether the admin API is served under `/admin` on the proxy
    /// listener (no dedicated admin port configured).
    pub fn admin_inline(&self) -> bool {
        self.admin_inline
    }

    /// Upsert an upstream live. The store swap is what requests observe;
    /// the config snapshot is refreshed so admin listings agree.
    pub async fn upsert_upstream(&self, upstream: UpstreamConfig) {
        let _guard = self.config_mu.lock().await;
        self.upstreams.upsert(upstream.clone());

        let mut config = (**self.config.load()).clone();
        match config.upstreams.iter_mut().find(|u| u.name == upstream.name) {
            Some(existing) => *existing = upstream.clone(),
            None => config.upstreams.push(upstream.clone()),
        }
        self.config.store(Arc::new(config));
        info!("admin: upstream upserted, name={}", upstream.name);
    }

    pub async fn delete_upstream(&self, name: &str) -> bool {
        let _guard = self.config_mu.lock().await;
        if !self.upstreams.remove(name) {
            return false;
        }
        let mut config = (**self.config.load()).clone();
        config.upstreams.retain(|u| u.name != name);
        self.config.store(Arc::new(config));
        info!("admin: upstream deleted, name={}", name);
        true
    }

    pub async fn add_target(&self, upstream: &str, target: TargetConfig) -> bool {
        let _guard = self.config_mu.lock().await;
        if !self.upstreams.add_target(upstream, target.clone()) {
            return false;
        }
        let mut config = (**self.config.load()).clone();
        if let Some(up) = config.upstreams.iter_mut().find(|u| u.name == upstream) {
            up.targets.push(target);
        }
        self.config.store(Arc::new(config));
        info!("admin: target added, upstream={}", upstream);
        true
    }

    /// Stop background work owned by the state (health checkers).
    pub fn shutdown(&self) {
        self.upstreams.shutdown();
    }
}
