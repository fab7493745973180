use crate::config::{PluginConfig, ServiceConfig};
use crate::plugins::{merge_plugin_configs, Plugin, Registry};
use anyhow::Result;
use std::sync::Arc;

/// A route path pattern: exact (`/api/users`) or wildcard suffix
/// (`/api/users/*`). A wildcard matches the bare prefix and anything
/// below it.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    prefix: String,
    wildcard: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(head) => {
                let prefix = head.trim_end_matches('/').to_string();
                Self {
                    raw: raw.to_string(),
                    prefix,
                    wildcard: true,
                }
            }
            None => Self {
                raw: raw.to_string(),
                prefix: raw.to_string(),
                wildcard: false,
            },
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        if !self.wildcard {
            return path == self.raw;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Pattern specificity: the literal prefix length (wildcard tail
    /// excluded). Longest wins among matching routes.
    pub fn match_len(&self) -> usize {
        self.prefix.len()
    }

    /// The path remainder once the matched prefix is stripped.
    pub fn strip(&self, path: &str) -> String {
        if !self.wildcard {
            return "/".to_string();
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => "/".to_string(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// A route compiled at config load: patterns parsed, methods normalized,
/// and the merged plugin chain built once (never per request).
pub struct CompiledRoute {
    pub name: String,
    pub service: String,
    pub upstream: String,
    pub service_path: Option<String>,
    pub methods: Vec<String>,
    pub patterns: Vec<PathPattern>,
    pub strip_path: bool,
    pub plugins: Arc<Vec<Plugin>>,
    order: usize,
}

/// The materialized result of routing one request.
pub struct RouteMatch {
    pub route: Arc<CompiledRoute>,
    /// Path forwarded upstream, after strip rules and the service prefix.
    pub forward_path: String,
}

/// Immutable routing table, swapped wholesale on reload.
pub struct Router {
    routes: Vec<Arc<CompiledRoute>>,
}

impl Router {
    /// Compile all enabled services' routes. Plugin chains are the global
    /// list merged with each route's list (route entries override
    /// same-named globals in place).
    pub fn build(
        services: &[ServiceConfig],
        global_plugins: &[PluginConfig],
        registry: &Registry,
    ) -> Result<Self> {
        let mut routes = Vec::new();
        let mut order = 0usize;

        for svc in services {
            if !svc.enabled {
                continue;
            }
            for (idx, route_cfg) in svc.routes.iter().enumerate() {
                let name = if route_cfg.name.is_empty() {
                    format!("{}-route-{}", svc.name, idx)
                } else {
                    route_cfg.name.clone()
                };

                let merged = merge_plugin_configs(global_plugins, &route_cfg.plugins);
                let mut plugins = Vec::with_capacity(merged.len());
                for cfg in &merged {
                    // Route-level entries get a route-scoped state namespace;
                    // inherited globals share theirs across routes.
                    let from_route = route_cfg.plugins.iter().any(|p| p.name == cfg.name);
                    let scope = if from_route { name.as_str() } else { "global" };
                    let plugin = registry.build(cfg, scope).map_err(|e| {
                        anyhow::anyhow!("route {}: plugin {}: {}", name, cfg.name, e)
                    })?;
                    plugins.push(plugin);
                }

                tracing::debug!(
                    "routing: compiled route, service={}, name={}, paths={:?}, plugins={}",
                    svc.name,
                    name,
                    route_cfg.paths,
                    plugins.len(),
                );

                routes.push(Arc::new(CompiledRoute {
                    name,
                    service: svc.name.clone(),
                    upstream: svc.upstream.clone(),
                    service_path: svc.path.clone(),
                    methods: route_cfg.methods.iter().map(|m| m.to_uppercase()).collect(),
                    patterns: route_cfg.paths.iter().map(|p| PathPattern::parse(p)).collect(),
                    strip_path: route_cfg.strip_path,
                    plugins: Arc::new(plugins),
                    order,
                }));
                order += 1;
            }
        }

        tracing::info!("routing: compiled route table, count={}", routes.len());
        Ok(Self { routes })
    }

    /// Deterministic match: method must be allowed and any pattern must
    /// match; the longest matching pattern wins, ties break toward the
    /// earlier declared route.
    pub fn match_route(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let method_upper = method.to_uppercase();
        let mut best: Option<(usize, usize, &Arc<CompiledRoute>, &PathPattern)> = None;

        for route in &self.routes {
            if !route.methods.is_empty() && !route.methods.iter().any(|m| m == &method_upper) {
                continue;
            }
            for pattern in &route.patterns {
                if !pattern.matches(path) {
                    continue;
                }
                let len = pattern.match_len();
                let better = match best {
                    Some((best_len, best_order, _, _)) => {
                        len > best_len || (len == best_len && route.order < best_order)
                    }
                    None => true,
                };
                if better {
                    best = Some((len, route.order, route, pattern));
                }
            }
        }

        best.map(|(_, _, route, pattern)| {
            let stripped = if route.strip_path {
                pattern.strip(path)
            } else {
                path.to_string()
            };
            let forward_path = match &route.service_path {
                Some(prefix) => {
                    let prefix = prefix.trim_end_matches('/');
                    if prefix.is_empty() {
                        stripped
                    } else {
                        format!("{}{}", prefix, stripped)
                    }
                }
                None => stripped,
            };
            RouteMatch {
                route: route.clone(),
                forward_path,
            }
        })
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}
