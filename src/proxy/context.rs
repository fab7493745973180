use crate::error::GatewayError;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Identity attached to a request by an auth plugin.
#[derive(Debug, Clone, Default)]
pub struct Consumer {
    pub username: Option<String>,
    pub custom_id: Option<String>,
    pub user_id: Option<String>,
}

/// Per-request state that flows through every phase: the mutable request
/// (headers, body, query), the matched route, the consumer set by auth
/// plugins, and the timing marks used by metrics and access logs.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    pub host: String,

    pub service_name: String,
    pub route_name: String,
    pub upstream_addr: String,

    pub consumer: Option<Consumer>,
    /// Credential identity (API key, JWT subject) for credential-keyed
    /// rate limiting.
    pub credential: Option<String>,
    /// Rate-limit headers computed in the access phase and attached to the
    /// response in the plugin's response phase.
    pub ratelimit_headers: Vec<(HeaderName, HeaderValue)>,
    /// Set when a plugin ended the access phase with a synthetic response.
    pub short_circuited: bool,

    pub received_at: Instant,
    pub upstream_sent_at: Option<Instant>,
    pub upstream_received_at: Option<Instant>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        client_ip: IpAddr,
        host: String,
    ) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            body,
            client_ip,
            host,
            service_name: String::new(),
            route_name: String::new(),
            upstream_addr: String::new(),
            consumer: None,
            credential: None,
            ratelimit_headers: Vec::new(),
            short_circuited: false,
            received_at: Instant::now(),
            upstream_sent_at: None,
            upstream_received_at: None,
        }
    }

    /// Build a JSON error response. Metrics are recorded once per request
    /// in `finalize_metrics` — every response, synthetic or proxied,
    /// passes through that single exit.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        // Messages can be operator-configured; serialize so quotes and
        // control characters cannot break the envelope.
        let body = serde_json::json!({ "error": msg }).to_string();
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap()
    }

    /// Error response for a typed request-path failure.
    pub fn failure_response(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        self.error_response(err.status_code(), err.client_message())
    }

    /// Record final metrics once the response is settled.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_name.clone(),
            "method" => self.method.as_str().to_owned(),
            "status_code" => status_str.to_owned(),
            "target" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_name.clone(),
        )
        .record(self.received_at.elapsed().as_secs_f64());

        if let Some(sent) = self.upstream_sent_at {
            let elapsed = match self.upstream_received_at {
                Some(received) => received.duration_since(sent),
                None => sent.elapsed(),
            };
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "route" => self.route_name.clone(),
                "target" => self.upstream_addr.clone(),
            )
            .record(elapsed.as_secs_f64());
        }

        if !self.route_name.is_empty() {
            metrics::gauge!(
                "gateway_http_requests_in_flight",
                "route" => self.route_name.clone(),
            )
            .decrement(1.0);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ctx;
    use super::*;

    async fn body_string(resp: hyper::Response<BoxBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_escapes_message() {
        let c = ctx(Method::GET, "/");
        let resp = c.error_response(StatusCode::FORBIDDEN, r#"say "no" to \ and
newlines"#);
        let body = body_string(resp).await;
        // The body must stay parseable JSON with the message intact.
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["error"], "say \"no\" to \\ and\nnewlines");
    }

    #[tokio::test]
    async fn test_failure_response_maps_kind() {
        let c = ctx(Method::GET, "/missing");
        let resp = c.failure_response(&GatewayError::RouteNotFound);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(resp).await, r#"{"error":"route not found"}"#);
    }
}
