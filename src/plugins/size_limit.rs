use super::{parse_options, PluginOutcome};
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use http::header::CONTENT_LENGTH;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SizeLimitOptions {
    /// Maximum request payload in megabytes.
    #[serde(default = "default_allowed_payload_size")]
    allowed_payload_size: u64,
}

fn default_allowed_payload_size() -> u64 {
    128
}

/// Rejects oversized request bodies with 413. Checks the declared
/// `Content-Length` and the buffered body size, so chunked requests
/// without a declared length are still bounded.
pub struct SizeLimit {
    limit_bytes: u64,
}

impl SizeLimit {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: SizeLimitOptions = parse_options(options)?;
        if opts.allowed_payload_size == 0 {
            anyhow::bail!("request-size-limiting: allowed_payload_size must be positive");
        }
        Ok(Self {
            limit_bytes: opts.allowed_payload_size * 1024 * 1024,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        let declared = ctx
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let oversized = match declared {
            Some(len) => len > self.limit_bytes,
            None => ctx.body.len() as u64 > self.limit_bytes,
        };

        if oversized {
            tracing::debug!(
                "request-size-limiting: rejected, declared={:?}, buffered={}, limit={}, route={}",
                declared,
                ctx.body.len(),
                self.limit_bytes,
                ctx.route_name
            );
            metrics::counter!(
                "gateway_plugin_short_circuits_total",
                "plugin" => "request-size-limiting",
                "route" => ctx.route_name.clone(),
            )
            .increment(1);
            return PluginOutcome::ShortCircuit(
                ctx.failure_response(&GatewayError::PayloadTooLarge),
            );
        }

        PluginOutcome::Continue
    }
}
