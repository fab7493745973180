use crate::error::GatewayError;
use crate::plugins::{Plugin, PluginOutcome};
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::routing::RouteMatch;
use crate::server::GatewayState;
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING,
    UPGRADE,
};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH — (method, path) → route, or 404
/// 2. ACCESS      — plugin chain in order; first short-circuit wins
/// 3. UPSTREAM    — target selection + forwarding with retry
/// 4. RESPONSE    — plugin chain in reverse over the executed prefix
/// 5. LOG         — plugin log phase, spawned off the critical path
///
/// Generic over the body type so tests can drive the full pipeline with
/// in-memory bodies.
pub async fn handle_request<B>(
    req: Request<B>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    // Admin API multiplexed onto the proxy listener when no dedicated
    // admin port is configured.
    if state.admin_inline() && req.uri().path().starts_with("/admin") {
        return crate::server::admin::handle_admin(req, state).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mut headers = req.headers().clone();

    // Real client IP: leftmost X-Forwarded-For entry when present (a
    // trusted proxy in front), otherwise the TCP peer address.
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    // Route match happens before the body is touched so a 404 costs
    // nothing.
    let route_match = {
        let router = state.router.load();
        router.match_route(method.as_str(), &path)
    };

    let Some(route_match) = route_match else {
        debug!("proxy: no route matched, method={}, path={}", method, path);
        let ctx = RequestContext::new(
            method,
            path,
            query,
            headers,
            Bytes::new(),
            client_ip,
            host,
        );
        ctx.finalize_metrics(404);
        return Ok(ctx.failure_response(&GatewayError::RouteNotFound));
    };

    // Buffer the body: retry replay, size limiting, and body transforms
    // all need it in hand.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read request body, error={}", e);
            let ctx = RequestContext::new(
                method,
                path,
                query,
                headers,
                Bytes::new(),
                client_ip,
                host,
            );
            ctx.finalize_metrics(400);
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    inject_forwarded_headers(&mut headers, peer_addr, &host);

    let mut ctx = RequestContext::new(method, path, query, headers, body, client_ip, host);
    ctx.route_name = route_match.route.name.clone();
    ctx.service_name = route_match.route.service.clone();

    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "route" => ctx.route_name.clone(),
    )
    .increment(1.0);

    let plugins = route_match.route.plugins.clone();

    // ACCESS phase: forward order, first short-circuit ends it.
    let mut executed = 0usize;
    let mut short_circuit: Option<Response<BoxBody>> = None;
    for plugin in plugins.iter() {
        executed += 1;
        match plugin.access(&mut ctx).await {
            PluginOutcome::Continue => {}
            PluginOutcome::ShortCircuit(resp) => {
                debug!(
                    "proxy: access short-circuit, plugin={}, route={}",
                    plugin.name(),
                    ctx.route_name
                );
                ctx.short_circuited = true;
                short_circuit = Some(resp);
                break;
            }
        }
    }

    let mut final_resp = match short_circuit {
        Some(resp) => resp,
        None => phase_upstream(&state, &mut ctx, &route_match).await,
    };

    // RESPONSE phase: reverse order over the plugins whose access ran, so
    // the outermost plugin sees the final response. A short-circuited
    // request still passes through the prefix that executed.
    for plugin in plugins[..executed].iter().rev() {
        plugin.response(&ctx, &mut final_resp).await;
    }

    let status = final_resp.status().as_u16();
    ctx.finalize_metrics(status);
    access_log(&ctx, status);

    // LOG phase: forward order over the same executed prefix, off the
    // critical path.
    tokio::spawn(async move {
        for plugin in plugins[..executed].iter() {
            plugin.log(&ctx, status);
        }
    });

    Ok(final_resp)
}

/// Upstream phase: target selection + request forwarding with retry.
///
/// Outcome classification per attempt:
/// - transport error          → breaker failure, 502 candidate
/// - timeout                  → breaker failure, 504 candidate
/// - status ∈ retry_on_status → breaker failure, retried when enabled,
///                              passed through when retry is off
/// - anything else            → breaker success, response returned
async fn phase_upstream(
    state: &GatewayState,
    ctx: &mut RequestContext,
    route_match: &RouteMatch,
) -> Response<BoxBody> {
    let Some(upstream) = state.upstreams.get(&route_match.route.upstream) else {
        warn!(
            "proxy: upstream missing, route={}, upstream={}",
            ctx.route_name, route_match.route.upstream
        );
        return ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    };

    let plan = upstream.retry_plan();
    let max_retries = if plan.enabled { plan.max_retries } else { 0 };

    // All attempts share one wall-clock budget so retries cannot multiply
    // the configured read timeout.
    let budget = std::time::Duration::from_secs_f64(upstream.config().timeout.read);
    let deadline = Instant::now() + budget;

    let mut tried: Vec<String> = Vec::new();
    let mut last_failure: Option<GatewayError> = None;

    let uri_tail = match &ctx.query {
        Some(q) => format!("{}?{}", route_match.forward_path, q),
        None => route_match.forward_path.clone(),
    };

    for attempt in 0..=max_retries {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                "proxy: deadline exhausted before attempt {}, route={}",
                attempt, ctx.route_name
            );
            return ctx.failure_response(&GatewayError::UpstreamTimeout);
        }

        let (target, guard) = match upstream.select(ctx.client_ip, &tried) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "proxy: no target available, route={}, upstream={}",
                    ctx.route_name,
                    upstream.name()
                );
                // Exhausting the pool mid-retry surfaces as 503; the
                // failure that triggered the retry is secondary.
                return ctx.failure_response(&e);
            }
        };

        let endpoint = target.endpoint().to_owned();
        ctx.upstream_addr.clear();
        ctx.upstream_addr.push_str(&endpoint);

        let outbound = match build_outbound_request(ctx, &endpoint, &uri_tail) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "proxy: failed to build upstream request, route={}, error={}",
                    ctx.route_name, e
                );
                return ctx
                    .error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            }
        };

        if attempt == 0 {
            ctx.upstream_sent_at = Some(Instant::now());
        }

        let result =
            tokio::time::timeout(remaining, upstream.http_client().request(outbound)).await;

        match result {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let failed = plan.retry_on_status.contains(&status);
                upstream.report(&endpoint, !failed);

                if failed && plan.enabled && attempt < max_retries {
                    debug!(
                        "proxy: retryable status {}, route={}, target={}, attempt={}/{}",
                        status,
                        ctx.route_name,
                        endpoint,
                        attempt + 1,
                        max_retries
                    );
                    metrics::counter!(
                        "gateway_upstream_retries_total",
                        "route" => ctx.route_name.clone(),
                        "reason" => "status",
                    )
                    .increment(1);
                    drop(guard);
                    tried.push(endpoint);
                    last_failure = Some(GatewayError::UpstreamError(format!("status {}", status)));
                    continue;
                }

                if failed && plan.enabled {
                    // Retries exhausted on a retryable status.
                    drop(guard);
                    return ctx.failure_response(&GatewayError::UpstreamError(format!(
                        "status {}",
                        status
                    )));
                }

                ctx.upstream_received_at = Some(Instant::now());
                drop(guard);
                return downstream_response(resp);
            }
            Ok(Err(e)) => {
                upstream.report(&endpoint, false);
                drop(guard);

                if plan.enabled && attempt < max_retries {
                    debug!(
                        "proxy: transport error (retrying), route={}, target={}, attempt={}/{}, error={}",
                        ctx.route_name, endpoint, attempt + 1, max_retries, e
                    );
                    metrics::counter!(
                        "gateway_upstream_retries_total",
                        "route" => ctx.route_name.clone(),
                        "reason" => "transport",
                    )
                    .increment(1);
                    tried.push(endpoint);
                    last_failure = Some(GatewayError::UpstreamError(e.to_string()));
                    continue;
                }

                warn!(
                    "proxy: upstream error, route={}, target={}, error={}",
                    ctx.route_name, endpoint, e
                );
                return ctx.failure_response(&GatewayError::UpstreamError(e.to_string()));
            }
            Err(_) => {
                upstream.report(&endpoint, false);
                drop(guard);

                if plan.enabled && attempt < max_retries {
                    debug!(
                        "proxy: timeout (retrying), route={}, target={}, attempt={}/{}",
                        ctx.route_name,
                        endpoint,
                        attempt + 1,
                        max_retries
                    );
                    metrics::counter!(
                        "gateway_upstream_retries_total",
                        "route" => ctx.route_name.clone(),
                        "reason" => "timeout",
                    )
                    .increment(1);
                    tried.push(endpoint);
                    last_failure = Some(GatewayError::UpstreamTimeout);
                    continue;
                }

                warn!(
                    "proxy: upstream timeout, route={}, target={}",
                    ctx.route_name, endpoint
                );
                return ctx.failure_response(&GatewayError::UpstreamTimeout);
            }
        }
    }

    let err = last_failure.unwrap_or_else(|| GatewayError::UpstreamError("exhausted".into()));
    ctx.failure_response(&err)
}

fn build_outbound_request(
    ctx: &RequestContext,
    endpoint: &str,
    uri_tail: &str,
) -> anyhow::Result<Request<BoxBody>> {
    let uri = format!("http://{}{}", endpoint, uri_tail);

    let mut headers = ctx.headers.clone();
    remove_hop_headers(&mut headers);
    // The body may have been rewritten by a transformer; the declared
    // length must describe what actually goes out.
    if ctx.body.is_empty() {
        headers.remove(CONTENT_LENGTH);
    } else if let Ok(v) = HeaderValue::from_str(&ctx.body.len().to_string()) {
        headers.insert(CONTENT_LENGTH, v);
    }

    let mut builder = Request::builder().method(ctx.method.clone()).uri(&uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    Ok(builder.body(full_body(ctx.body.clone()))?)
}

fn downstream_response(resp: Response<hyper::body::Incoming>) -> Response<BoxBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, body.boxed())
}

/// Hop-by-hop headers never cross the proxy; Host is rebuilt from the
/// target endpoint by the client.
fn remove_hop_headers(headers: &mut http::HeaderMap) {
    const EXTRA_HOP_HEADERS: &[&str] = &["keep-alive", "proxy-authenticate", "proxy-authorization"];

    for h in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, HOST] {
        headers.remove(h);
    }
    for h in EXTRA_HOP_HEADERS {
        headers.remove(*h);
    }
}

/// Inject standard `X-Forwarded-*` headers so targets can identify the
/// original client and protocol.
///
/// - `X-Forwarded-For`: append the TCP peer IP to any existing value.
/// - `X-Forwarded-Proto`: trust an incoming value (TLS terminates in
///   front of the gateway); default to "http" when absent.
/// - `X-Forwarded-Host`: the original `Host` header value.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }
}

/// Structured access log — one line per request at info level.
fn access_log(ctx: &RequestContext, status: u16) {
    let total_ms = ctx.received_at.elapsed().as_millis();
    let upstream_ms = match (ctx.upstream_sent_at, ctx.upstream_received_at) {
        (Some(sent), Some(received)) => received.duration_since(sent).as_millis(),
        _ => 0,
    };

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.path,
        status = status,
        service = %ctx.service_name,
        route = %ctx.route_name,
        target = %ctx.upstream_addr,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}
