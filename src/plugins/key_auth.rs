use super::{parse_options, PluginOutcome};
use crate::error::GatewayError;
use crate::proxy::context::{Consumer, RequestContext};
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct KeyAuthOptions {
    /// Headers searched for the key, in order.
    #[serde(default = "default_key_names")]
    key_names: Vec<String>,

    /// Also accept the key as a query parameter (same names).
    #[serde(default = "default_true")]
    key_in_query: bool,

    /// Strip the credential before forwarding upstream.
    #[serde(default)]
    hide_credentials: bool,

    /// Recognized credentials and the consumer each one maps to.
    #[serde(default)]
    keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    key: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    custom_id: Option<String>,
}

fn default_key_names() -> Vec<String> {
    vec!["apikey".to_string()]
}

fn default_true() -> bool {
    true
}

/// API-key authentication against a configured key set.
pub struct KeyAuth {
    key_names: Vec<String>,
    key_in_query: bool,
    hide_credentials: bool,
    keys: HashMap<String, (Option<String>, Option<String>)>,
}

impl KeyAuth {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: KeyAuthOptions = parse_options(options)?;
        let keys = opts
            .keys
            .into_iter()
            .map(|e| (e.key, (e.username, e.custom_id)))
            .collect();
        Ok(Self {
            key_names: opts.key_names,
            key_in_query: opts.key_in_query,
            hide_credentials: opts.hide_credentials,
            keys,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        let found = self.find_credential(ctx);

        let Some((key, location)) = found else {
            return self.reject(ctx);
        };

        let Some((username, custom_id)) = self.keys.get(&key) else {
            tracing::debug!("key-auth: unknown key, route={}", ctx.route_name);
            return self.reject(ctx);
        };

        ctx.consumer = Some(Consumer {
            username: username.clone(),
            custom_id: custom_id.clone(),
            user_id: None,
        });
        ctx.credential = Some(key.clone());

        if self.hide_credentials {
            self.strip_credential(ctx, &location);
        }

        PluginOutcome::Continue
    }

    /// Where the accepted key was found, for `hide_credentials`.
    fn find_credential(&self, ctx: &RequestContext) -> Option<(String, CredentialLocation)> {
        for name in &self.key_names {
            if let Some(value) = ctx.headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                return Some((value.to_string(), CredentialLocation::Header(name.clone())));
            }
        }
        if self.key_in_query {
            if let Some(query) = &ctx.query {
                for (k, v) in parse_query(query) {
                    if self.key_names.iter().any(|n| n == &k) {
                        return Some((v, CredentialLocation::Query(k)));
                    }
                }
            }
        }
        None
    }

    fn strip_credential(&self, ctx: &mut RequestContext, location: &CredentialLocation) {
        match location {
            CredentialLocation::Header(name) => {
                ctx.headers.remove(name.as_str());
            }
            CredentialLocation::Query(param) => {
                if let Some(query) = &ctx.query {
                    let kept: Vec<String> = query
                        .split('&')
                        .filter(|pair| {
                            pair.split_once('=').map(|(k, _)| k).unwrap_or(pair) != param
                        })
                        .map(String::from)
                        .collect();
                    ctx.query = if kept.is_empty() {
                        None
                    } else {
                        Some(kept.join("&"))
                    };
                }
            }
        }
    }

    fn reject(&self, ctx: &RequestContext) -> PluginOutcome {
        metrics::counter!(
            "gateway_plugin_short_circuits_total",
            "plugin" => "key-auth",
            "route" => ctx.route_name.clone(),
        )
        .increment(1);
        PluginOutcome::ShortCircuit(
            ctx.failure_response(&GatewayError::AuthInvalid("invalid api key".into())),
        )
    }
}

enum CredentialLocation {
    Header(String),
    Query(String),
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
