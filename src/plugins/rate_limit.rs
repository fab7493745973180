use super::{parse_options, PluginOutcome};
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use dashmap::DashMap;
use http::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Fixed time windows supported by the limiter, smallest first so
/// `Retry-After` naturally reports the soonest reset.
const WINDOWS: &[(&str, u64)] = &[
    ("second", 1),
    ("minute", 60),
    ("hour", 3600),
    ("day", 86_400),
];

/// Entries not touched for this long are eligible for eviction.
const GC_EXPIRE_SECS: u64 = 2 * 86_400;
const GC_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct RateLimitingOptions {
    #[serde(default)]
    second: Option<u64>,
    #[serde(default)]
    minute: Option<u64>,
    #[serde(default)]
    hour: Option<u64>,
    #[serde(default)]
    day: Option<u64>,

    /// "ip", "consumer", "credential", or "header".
    #[serde(default = "default_limit_by")]
    limit_by: String,

    /// Header carrying the counter identity when `limit_by` is "header".
    #[serde(default)]
    header_name: Option<String>,

    #[serde(default)]
    hide_client_headers: bool,

    /// Only "local" is supported; validated again here in case the plugin
    /// is built outside config loading (admin-supplied options).
    #[serde(default = "default_policy")]
    policy: String,
}

fn default_limit_by() -> String {
    "ip".to_string()
}

fn default_policy() -> String {
    "local".to_string()
}

enum LimitBy {
    Ip,
    Consumer,
    Credential,
    Header,
}

/// Process-wide fixed-window counters, shared by every rate-limiting
/// plugin instance and created once at gateway start.
///
/// Keys are `scope|identity|window`; a slot holds the start of the window
/// it is counting and rolls over lazily on first touch past the boundary.
/// Stale slots are purged by a background GC task.
pub struct CounterStore {
    slots: DashMap<String, Mutex<WindowSlot>>,
    last_access: DashMap<String, AtomicU64>,
}

struct WindowSlot {
    window_start: u64,
    count: u64,
}

impl Default for CounterStore {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
            last_access: DashMap::new(),
        }
    }
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key` in the window containing `now`.
    fn current(&self, key: &str, window_secs: u64, now: u64) -> u64 {
        let start = now - now % window_secs;
        match self.slots.get(key) {
            Some(slot) => {
                let guard = slot.lock().unwrap();
                if guard.window_start == start {
                    guard.count
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Increment `key` within the window containing `now`; returns the
    /// count after the increment.
    fn increment(&self, key: &str, window_secs: u64, now: u64) -> u64 {
        let start = now - now % window_secs;
        self.touch(key, now);

        let slot = self.slots.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(WindowSlot {
                window_start: start,
                count: 0,
            })
        });
        let mut guard = slot.lock().unwrap();
        if guard.window_start != start {
            guard.window_start = start;
            guard.count = 0;
        }
        guard.count += 1;
        guard.count
    }

    fn touch(&self, key: &str, now: u64) {
        if let Some(entry) = self.last_access.get(key) {
            entry.store(now, Ordering::Relaxed);
            return;
        }
        self.last_access
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(now));
    }

    /// Spawn the lazy-purge task. Call once after gateway start.
    pub fn start_gc(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                store.evict_stale(epoch_secs());
            }
        });
    }

    fn evict_stale(&self, now: u64) {
        self.last_access
            .retain(|_, v| now.saturating_sub(v.load(Ordering::Relaxed)) < GC_EXPIRE_SECS);
        self.slots
            .retain(|k, _| self.last_access.contains_key(k));
    }
}

/// Fixed-window request counting with per-window client headers.
///
/// The check is two-phase so counters move by exactly one per accepted
/// request: every configured window is inspected first, and increments
/// happen only when all of them admit the request.
pub struct RateLimiting {
    limits: Vec<(&'static str, u64, u64)>, // (window name, window secs, limit)
    limit_by: LimitBy,
    header_name: Option<String>,
    hide_client_headers: bool,
    scope: String,
    store: Arc<CounterStore>,
}

impl RateLimiting {
    pub fn new(options: &serde_json::Value, scope: &str, store: Arc<CounterStore>) -> Result<Self> {
        let opts: RateLimitingOptions = parse_options(options)?;

        if opts.policy != "local" {
            anyhow::bail!("rate-limiting: unsupported policy: {}", opts.policy);
        }

        let configured = [opts.second, opts.minute, opts.hour, opts.day];
        let mut limits = Vec::new();
        for ((name, secs), limit) in WINDOWS.iter().zip(configured) {
            if let Some(limit) = limit {
                if limit == 0 {
                    anyhow::bail!("rate-limiting: {} limit must be positive", name);
                }
                limits.push((*name, *secs, limit));
            }
        }
        if limits.is_empty() {
            anyhow::bail!("rate-limiting: at least one window (second/minute/hour/day) required");
        }

        let limit_by = match opts.limit_by.as_str() {
            "ip" => LimitBy::Ip,
            "consumer" => LimitBy::Consumer,
            "credential" => LimitBy::Credential,
            "header" => LimitBy::Header,
            other => anyhow::bail!("rate-limiting: unknown limit_by: {}", other),
        };
        if matches!(limit_by, LimitBy::Header) && opts.header_name.is_none() {
            anyhow::bail!("rate-limiting: limit_by=header requires header_name");
        }

        Ok(Self {
            limits,
            limit_by,
            header_name: opts.header_name,
            hide_client_headers: opts.hide_client_headers,
            scope: scope.to_string(),
            store,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        let identity = self.identity(ctx);
        let now = epoch_secs();

        // Phase 1: peek every window.
        let mut retry_after: Option<u64> = None;
        let mut counts = Vec::with_capacity(self.limits.len());
        for (name, secs, limit) in &self.limits {
            let key = self.key(&identity, name);
            let count = self.store.current(&key, *secs, now);
            if count >= *limit {
                let reset = *secs - now % *secs;
                retry_after = Some(retry_after.map_or(reset, |r| r.min(reset)));
            }
            counts.push(count);
        }

        if let Some(retry_after) = retry_after {
            if !self.hide_client_headers {
                for ((name, _, limit), count) in self.limits.iter().zip(&counts) {
                    let remaining = limit.saturating_sub(*count);
                    self.push_window_headers(ctx, name, *limit, remaining);
                }
            }

            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "route" => ctx.route_name.clone(),
            )
            .increment(1);
            tracing::debug!(
                "rate-limiting: rejected, route={}, identity={}",
                ctx.route_name,
                identity
            );

            let mut resp = ctx.failure_response(&GatewayError::RateLimited);
            if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                resp.headers_mut().insert(http::header::RETRY_AFTER, v);
            }
            return PluginOutcome::ShortCircuit(resp);
        }

        // Phase 2: all windows admit — count the request in each.
        for (name, secs, limit) in &self.limits {
            let key = self.key(&identity, name);
            let count = self.store.increment(&key, *secs, now);
            if !self.hide_client_headers {
                self.push_window_headers(ctx, name, *limit, limit.saturating_sub(count));
            }
        }

        metrics::counter!(
            "gateway_rate_limit_allowed_total",
            "route" => ctx.route_name.clone(),
        )
        .increment(1);

        PluginOutcome::Continue
    }

    /// Response phase: attach the headers computed during access to
    /// whatever response goes out, proxied or short-circuited.
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<crate::proxy::context::BoxBody>) {
        for (name, value) in &ctx.ratelimit_headers {
            resp.headers_mut().insert(name.clone(), value.clone());
        }
    }

    fn push_window_headers(&self, ctx: &mut RequestContext, window: &str, limit: u64, remaining: u64) {
        let limit_name = HeaderName::from_bytes(format!("x-ratelimit-limit-{}", window).as_bytes());
        let remaining_name =
            HeaderName::from_bytes(format!("x-ratelimit-remaining-{}", window).as_bytes());
        if let (Ok(ln), Ok(rn)) = (limit_name, remaining_name) {
            if let (Ok(lv), Ok(rv)) = (
                HeaderValue::from_str(&limit.to_string()),
                HeaderValue::from_str(&remaining.to_string()),
            ) {
                ctx.ratelimit_headers.push((ln, lv));
                ctx.ratelimit_headers.push((rn, rv));
            }
        }
    }

    fn key(&self, identity: &str, window: &str) -> String {
        let mut key = String::with_capacity(self.scope.len() + identity.len() + window.len() + 2);
        key.push_str(&self.scope);
        key.push('|');
        key.push_str(identity);
        key.push('|');
        key.push_str(window);
        key
    }

    /// Counter identity per `limit_by`, falling back to the client IP
    /// when the configured discriminator is absent.
    fn identity(&self, ctx: &RequestContext) -> String {
        match self.limit_by {
            LimitBy::Ip => ctx.client_ip.to_string(),
            LimitBy::Consumer => ctx
                .consumer
                .as_ref()
                .and_then(|c| {
                    c.username
                        .clone()
                        .or_else(|| c.user_id.clone())
                        .or_else(|| c.custom_id.clone())
                })
                .unwrap_or_else(|| ctx.client_ip.to_string()),
            LimitBy::Credential => ctx
                .credential
                .clone()
                .unwrap_or_else(|| ctx.client_ip.to_string()),
            LimitBy::Header => self
                .header_name
                .as_ref()
                .and_then(|h| ctx.headers.get(h.as_str()))
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .unwrap_or_else(|| ctx.client_ip.to_string()),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::test_support::ctx;
    use crate::proxy::context::Consumer;
    use http::Method;
    use serde_json::json;

    fn plugin(options: serde_json::Value) -> RateLimiting {
        RateLimiting::new(&options, "test-route", Arc::new(CounterStore::new())).unwrap()
    }

    fn find_header<'a>(c: &'a RequestContext, name: &str) -> Option<&'a HeaderValue> {
        c.ratelimit_headers
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
    }

    #[test]
    fn test_allows_up_to_limit_then_rejects() {
        let p = plugin(json!({"minute": 2, "limit_by": "ip"}));

        let mut c = ctx(Method::GET, "/api");
        assert!(matches!(p.on_access(&mut c), PluginOutcome::Continue));

        let mut c = ctx(Method::GET, "/api");
        assert!(matches!(p.on_access(&mut c), PluginOutcome::Continue));
        assert_eq!(
            find_header(&c, "x-ratelimit-remaining-minute").unwrap(),
            "0"
        );

        let mut c = ctx(Method::GET, "/api");
        match p.on_access(&mut c) {
            PluginOutcome::ShortCircuit(resp) => {
                assert_eq!(resp.status(), 429);
                let retry_after: u64 = resp
                    .headers()
                    .get(http::header::RETRY_AFTER)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert!(retry_after <= 60);
                assert_eq!(
                    find_header(&c, "x-ratelimit-remaining-minute").unwrap(),
                    "0"
                );
            }
            PluginOutcome::Continue => panic!("third request should be limited"),
        }
    }

    #[test]
    fn test_rejected_request_does_not_consume() {
        let p = plugin(json!({"hour": 1}));

        let mut c = ctx(Method::GET, "/api");
        assert!(matches!(p.on_access(&mut c), PluginOutcome::Continue));

        // Repeated rejections leave the counter at the limit.
        for _ in 0..5 {
            let mut c = ctx(Method::GET, "/api");
            assert!(matches!(p.on_access(&mut c), PluginOutcome::ShortCircuit(_)));
        }
        let identity = "198.51.100.10";
        let key = format!("test-route|{}|hour", identity);
        assert_eq!(p.store.current(&key, 3600, epoch_secs()), 1);
    }

    #[test]
    fn test_distinct_ips_independent() {
        let p = plugin(json!({"minute": 1}));

        let mut a = ctx(Method::GET, "/api");
        a.client_ip = "10.0.0.1".parse().unwrap();
        assert!(matches!(p.on_access(&mut a), PluginOutcome::Continue));
        let mut a2 = ctx(Method::GET, "/api");
        a2.client_ip = "10.0.0.1".parse().unwrap();
        assert!(matches!(p.on_access(&mut a2), PluginOutcome::ShortCircuit(_)));

        let mut b = ctx(Method::GET, "/api");
        b.client_ip = "10.0.0.2".parse().unwrap();
        assert!(matches!(p.on_access(&mut b), PluginOutcome::Continue));
    }

    #[test]
    fn test_limit_by_consumer() {
        let p = plugin(json!({"minute": 1, "limit_by": "consumer"}));

        let mut a = ctx(Method::GET, "/api");
        a.consumer = Some(Consumer {
            username: Some("alice".into()),
            ..Consumer::default()
        });
        assert!(matches!(p.on_access(&mut a), PluginOutcome::Continue));

        // Same consumer from a different IP still shares the counter.
        let mut a2 = ctx(Method::GET, "/api");
        a2.client_ip = "10.9.9.9".parse().unwrap();
        a2.consumer = Some(Consumer {
            username: Some("alice".into()),
            ..Consumer::default()
        });
        assert!(matches!(p.on_access(&mut a2), PluginOutcome::ShortCircuit(_)));
    }

    #[test]
    fn test_limit_by_header() {
        let p = plugin(json!({"minute": 1, "limit_by": "header", "header_name": "x-tenant"}));

        let mut a = ctx(Method::GET, "/api");
        a.headers.insert("x-tenant", "acme".parse().unwrap());
        assert!(matches!(p.on_access(&mut a), PluginOutcome::Continue));

        let mut b = ctx(Method::GET, "/api");
        b.headers.insert("x-tenant", "umbrella".parse().unwrap());
        assert!(matches!(p.on_access(&mut b), PluginOutcome::Continue));

        let mut a2 = ctx(Method::GET, "/api");
        a2.headers.insert("x-tenant", "acme".parse().unwrap());
        assert!(matches!(p.on_access(&mut a2), PluginOutcome::ShortCircuit(_)));
    }

    #[test]
    fn test_hide_client_headers() {
        let p = plugin(json!({"minute": 1, "hide_client_headers": true}));
        let mut c = ctx(Method::GET, "/api");
        assert!(matches!(p.on_access(&mut c), PluginOutcome::Continue));
        assert!(c.ratelimit_headers.is_empty());
    }

    #[test]
    fn test_scopes_are_isolated() {
        let store = Arc::new(CounterStore::new());
        let route_a =
            RateLimiting::new(&json!({"minute": 1}), "route-a", store.clone()).unwrap();
        let route_b =
            RateLimiting::new(&json!({"minute": 1}), "route-b", store.clone()).unwrap();

        let mut c = ctx(Method::GET, "/a");
        assert!(matches!(route_a.on_access(&mut c), PluginOutcome::Continue));
        // Same IP on another route scope is unaffected.
        let mut c = ctx(Method::GET, "/b");
        assert!(matches!(route_b.on_access(&mut c), PluginOutcome::Continue));
        let mut c = ctx(Method::GET, "/a");
        assert!(matches!(route_a.on_access(&mut c), PluginOutcome::ShortCircuit(_)));
    }

    #[test]
    fn test_build_rejections() {
        let store = Arc::new(CounterStore::new());
        // No windows.
        assert!(RateLimiting::new(&json!({}), "s", store.clone()).is_err());
        // Zero limit.
        assert!(RateLimiting::new(&json!({"minute": 0}), "s", store.clone()).is_err());
        // Unknown limit_by.
        assert!(
            RateLimiting::new(&json!({"minute": 1, "limit_by": "planet"}), "s", store.clone())
                .is_err()
        );
        // header mode without header_name.
        assert!(
            RateLimiting::new(&json!({"minute": 1, "limit_by": "header"}), "s", store.clone())
                .is_err()
        );
        // Remote policy.
        assert!(
            RateLimiting::new(&json!({"minute": 1, "policy": "redis"}), "s", store).is_err()
        );
    }

    #[test]
    fn test_store_window_rollover() {
        let store = CounterStore::new();
        assert_eq!(store.increment("k", 60, 100), 1);
        assert_eq!(store.increment("k", 60, 119), 2);
        // New window resets the count.
        assert_eq!(store.increment("k", 60, 120), 1);
        assert_eq!(store.current("k", 60, 120), 1);
        // Peeking a fresh window reads zero without resetting storage.
        assert_eq!(store.current("k", 60, 500), 0);
    }

    #[test]
    fn test_store_gc() {
        let store = CounterStore::new();
        store.increment("old", 60, 0);
        store.increment("new", 60, GC_EXPIRE_SECS + 100);
        store.evict_stale(GC_EXPIRE_SECS + 100);
        assert_eq!(store.current("old", 60, GC_EXPIRE_SECS + 100), 0);
        assert!(store.slots.contains_key("new"));
        assert!(!store.slots.contains_key("old"));
    }
}
