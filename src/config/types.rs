use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats an explicit `null`
/// the same as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration document.
///
/// `upstreams` and `services` describe the proxying topology; `plugins` is
/// the global plugin list applied to every route (route-level entries
/// override same-named globals).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, the admin API listens on its own port; otherwise it is
    /// served under the `/admin` prefix of the proxy listener.
    #[serde(default)]
    pub admin_port: Option<u16>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_port: None,
        }
    }
}

fn default_port() -> u16 {
    8000
}

/// Upstream (pool) definition. Owns targets, LB policy, timeouts,
/// health checks, circuit breakers, retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    /// "round-robin", "least-connections", "ip-hash", "weighted", "random".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_algorithm() -> String {
    "round-robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Per-attempt timeouts in seconds. `read` doubles as the wall-clock
/// budget shared by all retry attempts of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: f64,

    #[serde(default = "default_read_timeout")]
    pub read: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            read: default_read_timeout(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_read_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe interval in seconds.
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Per-probe timeout in seconds.
    #[serde(default = "default_hc_timeout")]
    pub timeout: u64,

    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Prevents probe storms on upstreams with many targets.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

fn default_true() -> bool {
    true
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_timeout() -> u64 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_hc_concurrency() -> usize {
    16
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_open_duration")]
    pub open_duration_secs: u64,
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_open_duration() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upstream statuses treated as attempt failures (retryable, and
    /// counted against the circuit breaker even when retry is disabled).
    #[serde(default = "default_retry_statuses")]
    pub retry_on_status: Vec<u16>,
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

/// A service binds routes to one upstream, optionally re-rooting the
/// forwarded path under `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Name of the upstream pool requests are forwarded to.
    pub upstream: String,

    /// Optional path prefix prepended to the forwarded path.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: String,

    /// Path patterns: exact (`/api/users`) or wildcard suffix
    /// (`/api/users/*`).
    pub paths: Vec<String>,

    /// Allowed HTTP methods. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_path: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub plugins: Vec<PluginConfig>,
}

/// A plugin reference: registry name plus free-form options. Options are
/// parsed into the plugin's typed config at route-compile time, so a bad
/// option set fails config load rather than a live request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    #[serde(default)]
    pub options: serde_json::Value,
}
