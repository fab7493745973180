use super::parse_options;
use super::request_transformer::{is_json_content, CompiledOps, TransformSpec};
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use anyhow::Result;
use http::header::CONTENT_LENGTH;
use http::HeaderValue;
use http_body_util::BodyExt;

/// Mutates the response on its way back to the client. Header ops always
/// apply; JSON body ops apply only when the response declares a JSON
/// content type, which requires buffering the body.
pub struct ResponseTransformer {
    ops: CompiledOps,
}

impl ResponseTransformer {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let spec: TransformSpec = parse_options(options)?;
        Ok(Self {
            ops: CompiledOps::compile(spec)?,
        })
    }

    pub async fn on_response(&self, ctx: &RequestContext, resp: &mut hyper::Response<BoxBody>) {
        self.ops.apply_headers(resp.headers_mut());

        if !self.ops.has_json_ops() || !is_json_content(resp.headers()) {
            return;
        }

        let body = std::mem::replace(resp.body_mut(), empty_body());
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                // Body already consumed; nothing sane to restore.
                tracing::warn!(
                    "response-transformer: failed to buffer body, route={}, error={}",
                    ctx.route_name,
                    e
                );
                return;
            }
        };

        let transformed = self.ops.apply_json(&bytes).unwrap_or(bytes);
        if let Ok(v) = HeaderValue::from_str(&transformed.len().to_string()) {
            resp.headers_mut().insert(CONTENT_LENGTH, v);
        }
        *resp.body_mut() = full_body(transformed);
    }
}
