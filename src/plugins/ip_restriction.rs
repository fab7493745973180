use super::{parse_options, PluginOutcome};
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use http::StatusCode;
use ipnetwork::IpNetwork;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct IpRestrictionOptions {
    /// Allowed addresses/ranges. Non-empty allow list rejects anything
    /// not on it.
    #[serde(default)]
    allow: Vec<String>,

    /// Denied addresses/ranges. Deny wins over allow.
    #[serde(default)]
    deny: Vec<String>,

    #[serde(default = "default_status")]
    status: u16,

    #[serde(default = "default_message")]
    message: String,
}

fn default_status() -> u16 {
    403
}

fn default_message() -> String {
    "IP address not allowed".to_string()
}

/// Allow/deny filtering on the client IP. The client IP is resolved once
/// per request (leftmost `X-Forwarded-For` entry when present, socket
/// address otherwise) and carried in the request context. Entries accept
/// single addresses and CIDR ranges.
pub struct IpRestriction {
    allow: Vec<IpNetwork>,
    deny: Vec<IpNetwork>,
    status: StatusCode,
    message: String,
}

impl IpRestriction {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: IpRestrictionOptions = parse_options(options)?;
        if opts.allow.is_empty() && opts.deny.is_empty() {
            anyhow::bail!("ip-restriction: requires at least one allow or deny entry");
        }
        Ok(Self {
            allow: parse_networks(&opts.allow)?,
            deny: parse_networks(&opts.deny)?,
            status: StatusCode::from_u16(opts.status)
                .map_err(|_| anyhow::anyhow!("ip-restriction: invalid status: {}", opts.status))?,
            message: opts.message,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        let ip = ctx.client_ip;

        let denied = self.deny.iter().any(|net| net.contains(ip));
        let allowed = self.allow.is_empty() || self.allow.iter().any(|net| net.contains(ip));

        if denied || !allowed {
            tracing::debug!(
                "ip-restriction: rejected, client_ip={}, route={}",
                ip,
                ctx.route_name
            );
            metrics::counter!(
                "gateway_plugin_short_circuits_total",
                "plugin" => "ip-restriction",
                "route" => ctx.route_name.clone(),
            )
            .increment(1);
            let err = GatewayError::Forbidden(self.message.clone());
            let mut resp = ctx.failure_response(&err);
            // The rejection status is operator-configurable (403 default).
            *resp.status_mut() = self.status;
            return PluginOutcome::ShortCircuit(resp);
        }

        PluginOutcome::Continue
    }
}

/// Parse entries as CIDR ranges; bare addresses get a full-length prefix.
fn parse_networks(entries: &[String]) -> Result<Vec<IpNetwork>> {
    entries
        .iter()
        .map(|e| {
            e.parse::<IpNetwork>()
                .map_err(|_| anyhow::anyhow!("ip-restriction: invalid address or CIDR: {}", e))
        })
        .collect()
}
