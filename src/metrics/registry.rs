use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/admin/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. A second call (tests building several states in one
    /// process) keeps the existing global recorder and returns a fresh
    /// handle.
    pub fn install() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .build_recorder();

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::debug!("metrics: global recorder already installed");
        }

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting for the upstream target"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // plugins
        describe_counter!(
            "gateway_plugin_short_circuits_total",
            Unit::Count,
            "Access-phase short circuits per plugin"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by rate limiting"
        );
        describe_counter!(
            "gateway_rate_limit_allowed_total",
            Unit::Count,
            "Total requests admitted by rate limiting"
        );
        describe_counter!(
            "gateway_log_delivery_total",
            Unit::Count,
            "Logging plugin HTTP sink delivery attempts"
        );

        // upstream health & resilience
        describe_gauge!(
            "gateway_upstream_health_status",
            Unit::Count,
            "Target health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Total active health probes"
        );
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Total upstream retry attempts"
        );
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Selections skipped because a target's circuit was open"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
