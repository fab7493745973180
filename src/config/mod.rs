pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a YAML file and apply environment variable
    /// overrides for listener settings. When the file does not exist,
    /// built-in defaults are used — the gateway starts with an empty
    /// topology that can be populated through the admin API.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config: loaded, upstreams={}, services={}, global_plugins={}",
            config.upstreams.len(),
            config.services.len(),
            config.plugins.len(),
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TORII_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.gateway.port = port;
            }
        }
        if let Ok(v) = std::env::var("TORII_ADMIN_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.gateway.admin_port = Some(port);
            }
        }
    }

    /// Structural validation. Any document that passes yields a consistent
    /// in-memory state: upstream references resolve, plugin names resolve
    /// against the registry, and plugin options parse (checked when routes
    /// are compiled, which also happens at load time).
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("gateway.port must be non-zero");
        }

        let mut upstream_names = HashSet::new();
        for up in &self.upstreams {
            if up.name.is_empty() {
                anyhow::bail!("upstream name cannot be empty");
            }
            if !upstream_names.insert(up.name.as_str()) {
                anyhow::bail!("duplicate upstream name: {}", up.name);
            }
            validate_upstream(up)?;
        }

        let mut service_names = HashSet::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                anyhow::bail!("service name cannot be empty");
            }
            if !service_names.insert(svc.name.as_str()) {
                anyhow::bail!("duplicate service name: {}", svc.name);
            }
            if !upstream_names.contains(svc.upstream.as_str()) {
                anyhow::bail!(
                    "service {} references unknown upstream: {}",
                    svc.name,
                    svc.upstream
                );
            }
            for route in &svc.routes {
                if route.paths.is_empty() {
                    anyhow::bail!("service {}: route has no paths", svc.name);
                }
                for path in &route.paths {
                    if !path.starts_with('/') {
                        anyhow::bail!(
                            "service {}: route path must start with '/': {}",
                            svc.name,
                            path
                        );
                    }
                }
                for plugin in &route.plugins {
                    validate_plugin_ref(plugin)?;
                }
            }
        }

        for plugin in &self.plugins {
            validate_plugin_ref(plugin)?;
        }

        Ok(())
    }
}

fn validate_upstream(up: &UpstreamConfig) -> Result<()> {
    match up.algorithm.as_str() {
        "round-robin" | "least-connections" | "ip-hash" | "weighted" | "random" => {}
        other => anyhow::bail!("upstream {}: unknown algorithm: {}", up.name, other),
    }
    for target in &up.targets {
        if target.host.is_empty() {
            anyhow::bail!("upstream {}: target host cannot be empty", up.name);
        }
        if target.port == 0 {
            anyhow::bail!("upstream {}: target port must be non-zero", up.name);
        }
    }
    Ok(())
}

fn validate_plugin_ref(plugin: &PluginConfig) -> Result<()> {
    if !crate::plugins::is_builtin(&plugin.name) {
        anyhow::bail!("unknown plugin: {}", plugin.name);
    }
    // The rate-limiting counter policy is local-only; reject anything else
    // at load time rather than guessing at request time.
    if plugin.name == "rate-limiting" {
        if let Some(policy) = plugin.options.get("policy").and_then(|v| v.as_str()) {
            if policy != "local" {
                anyhow::bail!("rate-limiting: unsupported policy: {}", policy);
            }
        }
    }
    Ok(())
}
