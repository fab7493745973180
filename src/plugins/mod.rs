pub mod cors;
pub mod ip_restriction;
pub mod jwt_auth;
pub mod key_auth;
pub mod logging;
pub mod rate_limit;
pub mod request_transformer;
pub mod response_transformer;
pub mod size_limit;

use crate::config::PluginConfig;
use crate::proxy::context::{BoxBody, RequestContext};
use anyhow::Result;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Result of a plugin's access phase.
pub enum PluginOutcome {
    /// Continue to the next plugin / the upstream.
    Continue,
    /// End the access phase with this synthetic response. The response
    /// still travels through the reverse response phase.
    ShortCircuit(hyper::Response<BoxBody>),
}

/// Enum-based plugin — static dispatch, exhaustive match, no trait
/// objects. Instances are built once per route when the route table is
/// compiled (config load / admin reload), NOT per request.
///
/// Adding a plugin:
/// 1. Add a module under `plugins/`
/// 2. Add a variant here and its name to `BUILTIN_PLUGINS`
/// 3. Wire the phase match arms and the `Registry::build` arm
pub enum Plugin {
    JwtAuth(jwt_auth::JwtAuth),
    KeyAuth(key_auth::KeyAuth),
    RateLimiting(rate_limit::RateLimiting),
    Cors(cors::Cors),
    RequestTransformer(request_transformer::RequestTransformer),
    ResponseTransformer(response_transformer::ResponseTransformer),
    IpRestriction(ip_restriction::IpRestriction),
    SizeLimit(size_limit::SizeLimit),
    Logging(logging::Logging),
}

pub const BUILTIN_PLUGINS: &[&str] = &[
    "jwt-auth",
    "key-auth",
    "rate-limiting",
    "cors",
    "request-transformer",
    "response-transformer",
    "ip-restriction",
    "request-size-limiting",
    "logging",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_PLUGINS.contains(&name)
}

impl Plugin {
    pub fn name(&self) -> &'static str {
        match self {
            Plugin::JwtAuth(_) => "jwt-auth",
            Plugin::KeyAuth(_) => "key-auth",
            Plugin::RateLimiting(_) => "rate-limiting",
            Plugin::Cors(_) => "cors",
            Plugin::RequestTransformer(_) => "request-transformer",
            Plugin::ResponseTransformer(_) => "response-transformer",
            Plugin::IpRestriction(_) => "ip-restriction",
            Plugin::SizeLimit(_) => "request-size-limiting",
            Plugin::Logging(_) => "logging",
        }
    }

    /// Access phase — before upstream selection. May mutate the request
    /// carried by `ctx` or short-circuit with a synthetic response.
    pub async fn access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        match self {
            Plugin::JwtAuth(p) => p.on_access(ctx),
            Plugin::KeyAuth(p) => p.on_access(ctx),
            Plugin::RateLimiting(p) => p.on_access(ctx),
            Plugin::Cors(p) => p.on_access(ctx),
            Plugin::RequestTransformer(p) => p.on_access(ctx),
            Plugin::IpRestriction(p) => p.on_access(ctx),
            Plugin::SizeLimit(p) => p.on_access(ctx),
            Plugin::ResponseTransformer(_) | Plugin::Logging(_) => PluginOutcome::Continue,
        }
    }

    /// Response phase — after the upstream answered (or a short-circuit
    /// produced a synthetic response). Runs in reverse access order.
    pub async fn response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        match self {
            Plugin::RateLimiting(p) => p.on_response(ctx, resp),
            Plugin::Cors(p) => p.on_response(ctx, resp),
            Plugin::ResponseTransformer(p) => p.on_response(ctx, resp).await,
            _ => {}
        }
    }

    /// Log phase — after the response has been handed to the client.
    /// Side-effect only; must never influence the request outcome.
    pub fn log(&self, ctx: &RequestContext, status: u16) {
        if let Plugin::Logging(p) = self {
            p.on_log(ctx, status);
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Plugin registry: maps config names to constructors and owns the
/// process-wide plugin state (the shared rate-limit counter store),
/// created at gateway start and torn down with it.
pub struct Registry {
    ratelimit_store: Arc<rate_limit::CounterStore>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            ratelimit_store: Arc::new(rate_limit::CounterStore::new()),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ratelimit_store(&self) -> &Arc<rate_limit::CounterStore> {
        &self.ratelimit_store
    }

    /// Instantiate a plugin from its config. `scope` namespaces stateful
    /// plugins: route-level entries get the route name, gateway-level
    /// entries share the "global" scope.
    pub fn build(&self, cfg: &PluginConfig, scope: &str) -> Result<Plugin> {
        let plugin = match cfg.name.as_str() {
            "jwt-auth" => Plugin::JwtAuth(jwt_auth::JwtAuth::new(&cfg.options)?),
            "key-auth" => Plugin::KeyAuth(key_auth::KeyAuth::new(&cfg.options)?),
            "rate-limiting" => Plugin::RateLimiting(rate_limit::RateLimiting::new(
                &cfg.options,
                scope,
                self.ratelimit_store.clone(),
            )?),
            "cors" => Plugin::Cors(cors::Cors::new(&cfg.options)?),
            "request-transformer" => Plugin::RequestTransformer(
                request_transformer::RequestTransformer::new(&cfg.options)?,
            ),
            "response-transformer" => Plugin::ResponseTransformer(
                response_transformer::ResponseTransformer::new(&cfg.options)?,
            ),
            "ip-restriction" => {
                Plugin::IpRestriction(ip_restriction::IpRestriction::new(&cfg.options)?)
            }
            "request-size-limiting" => Plugin::SizeLimit(size_limit::SizeLimit::new(&cfg.options)?),
            "logging" => Plugin::Logging(logging::Logging::new(&cfg.options)?),
            other => anyhow::bail!("unknown plugin: {}", other),
        };
        Ok(plugin)
    }
}

/// Merge the global plugin list with a route's list. A route entry
/// replaces a same-named global entry in place (keeping the global
/// position); new route entries append in their own order.
pub fn merge_plugin_configs(global: &[PluginConfig], route: &[PluginConfig]) -> Vec<PluginConfig> {
    let mut merged: Vec<PluginConfig> = global.to_vec();
    for entry in route {
        match merged.iter().position(|p| p.name == entry.name) {
            Some(idx) => merged[idx] = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Parse a plugin's free-form options into its typed config. A missing
/// options block parses as an empty mapping so defaults apply.
pub(crate) fn parse_options<T: DeserializeOwned>(options: &serde_json::Value) -> Result<T> {
    let value = if options.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        options.clone()
    };
    Ok(serde_json::from_value(value)?)
}
