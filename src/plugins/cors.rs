use super::{parse_options, PluginOutcome};
use crate::proxy::context::{empty_body, BoxBody, RequestContext};
use anyhow::Result;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CorsOptions {
    /// Allowed origins; "*" allows any.
    #[serde(default = "default_origins")]
    origins: Vec<String>,

    #[serde(default = "default_methods")]
    methods: Vec<String>,

    #[serde(default = "default_headers")]
    headers: Vec<String>,

    #[serde(default)]
    exposed_headers: Vec<String>,

    #[serde(default)]
    credentials: bool,

    /// Preflight cache lifetime in seconds.
    #[serde(default = "default_max_age")]
    max_age: u64,
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_methods() -> Vec<String> {
    ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_headers() -> Vec<String> {
    vec!["Content-Type".to_string(), "Authorization".to_string()]
}

fn default_max_age() -> u64 {
    3600
}

/// CORS handling: preflight requests short-circuit with 204 in the access
/// phase; actual responses pick up the allow-origin headers in the
/// response phase.
pub struct Cors {
    origins: Vec<String>,
    allow_any: bool,
    methods_value: HeaderValue,
    headers_value: HeaderValue,
    exposed_value: Option<HeaderValue>,
    credentials: bool,
    max_age_value: HeaderValue,
}

impl Cors {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: CorsOptions = parse_options(options)?;
        let allow_any = opts.origins.iter().any(|o| o == "*");

        let methods_value = HeaderValue::from_str(&opts.methods.join(", "))?;
        let headers_value = HeaderValue::from_str(&opts.headers.join(", "))?;
        let exposed_value = if opts.exposed_headers.is_empty() {
            None
        } else {
            Some(HeaderValue::from_str(&opts.exposed_headers.join(", "))?)
        };
        let max_age_value = HeaderValue::from_str(&opts.max_age.to_string())?;

        Ok(Self {
            origins: opts.origins,
            allow_any,
            methods_value,
            headers_value,
            exposed_value,
            credentials: opts.credentials,
            max_age_value,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        if ctx.method != Method::OPTIONS {
            return PluginOutcome::Continue;
        }
        let Some(origin) = ctx
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
        else {
            return PluginOutcome::Continue;
        };

        let mut resp = hyper::Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap();

        let headers = resp.headers_mut();
        if let Some(allow_origin) = self.resolve_origin(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                self.methods_value.clone(),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                self.headers_value.clone(),
            );
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, self.max_age_value.clone());
            if self.credentials {
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
        }

        PluginOutcome::ShortCircuit(resp)
    }

    pub fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        let Some(origin) = ctx
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let Some(allow_origin) = self.resolve_origin(origin) else {
            return;
        };

        let echoed = allow_origin != "*";
        let headers = resp.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if echoed {
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        if self.credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if let Some(ref exposed) = self.exposed_value {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
    }

    /// The allow-origin value for a request origin: "*" when any origin is
    /// allowed without credentials, the echoed origin when listed (or any
    /// + credentials, where "*" is invalid), `None` when disallowed.
    fn resolve_origin(&self, origin: &str) -> Option<HeaderValue> {
        if self.allow_any {
            if self.credentials {
                return HeaderValue::from_str(origin).ok();
            }
            return Some(HeaderValue::from_static("*"));
        }
        if self.origins.iter().any(|o| o == origin) {
            return HeaderValue::from_str(origin).ok();
        }
        None
    }
}
