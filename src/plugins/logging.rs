use super::parse_options;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct LoggingOptions {
    /// When set, the JSON record is POSTed here best-effort.
    #[serde(default)]
    http_endpoint: Option<String>,

    #[serde(default)]
    include_headers: bool,

    #[serde(default = "default_true")]
    include_timings: bool,
}

fn default_true() -> bool {
    true
}

/// Log-phase structured record per request. Runs after the response has
/// been handed to the client; delivery failures are counted and swallowed
/// — they never affect a request.
pub struct Logging {
    http_endpoint: Option<String>,
    include_headers: bool,
    include_timings: bool,
    client: Option<reqwest::Client>,
}

impl Logging {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: LoggingOptions = parse_options(options)?;
        let client = match opts.http_endpoint {
            Some(_) => Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(5))
                    .no_proxy()
                    .build()?,
            ),
            None => None,
        };
        Ok(Self {
            http_endpoint: opts.http_endpoint,
            include_headers: opts.include_headers,
            include_timings: opts.include_timings,
            client,
        })
    }

    pub fn on_log(&self, ctx: &RequestContext, status: u16) {
        let record = self.build_record(ctx, status);

        tracing::info!(
            target: "torii_gateway::plugin_log",
            record = %record,
            "request record"
        );

        if let (Some(endpoint), Some(client)) = (&self.http_endpoint, &self.client) {
            let client = client.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let result = client.post(&endpoint).json(&record).send().await;
                let outcome = match result {
                    Ok(resp) if resp.status().is_success() => "success",
                    Ok(resp) => {
                        tracing::debug!(
                            "logging: sink returned non-success status: {}",
                            resp.status()
                        );
                        "error"
                    }
                    Err(e) => {
                        tracing::debug!("logging: sink delivery failed: {}", e);
                        "error"
                    }
                };
                metrics::counter!(
                    "gateway_log_delivery_total",
                    "result" => outcome,
                )
                .increment(1);
            });
        }
    }

    fn build_record(&self, ctx: &RequestContext, status: u16) -> serde_json::Value {
        let mut record = serde_json::json!({
            "method": ctx.method.as_str(),
            "path": ctx.path,
            "status": status,
            "client_ip": ctx.client_ip.to_string(),
            "host": ctx.host,
            "service": ctx.service_name,
            "route": ctx.route_name,
            "target": ctx.upstream_addr,
        });

        if let Some(consumer) = &ctx.consumer {
            record["consumer"] = serde_json::json!({
                "username": consumer.username,
                "custom_id": consumer.custom_id,
                "user_id": consumer.user_id,
            });
        }

        if self.include_timings {
            let total_ms = ctx.received_at.elapsed().as_millis() as u64;
            let upstream_ms = match (ctx.upstream_sent_at, ctx.upstream_received_at) {
                (Some(sent), Some(received)) => {
                    Some(received.duration_since(sent).as_millis() as u64)
                }
                _ => None,
            };
            record["latency_ms"] = serde_json::json!(total_ms);
            record["upstream_ms"] = serde_json::json!(upstream_ms);
        }

        if self.include_headers {
            let headers: serde_json::Map<String, serde_json::Value> = ctx
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        serde_json::Value::String(
                            value.to_str().unwrap_or("<binary>").to_string(),
                        ),
                    )
                })
                .collect();
            record["headers"] = serde_json::Value::Object(headers);
        }

        record
    }
}
