use super::{parse_options, PluginOutcome};
use crate::error::GatewayError;
use crate::proxy::context::{Consumer, RequestContext};
use anyhow::Result;
use http::{HeaderName, HeaderValue};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct JwtAuthOptions {
    secret: String,

    #[serde(default = "default_algorithm")]
    algorithm: String,

    /// Headers searched for a bearer token, in order.
    #[serde(default = "default_header_names")]
    header_names: Vec<String>,

    /// Claims whose presence is required; "exp" additionally gets
    /// temporal validation.
    #[serde(default)]
    claims_to_verify: Vec<String>,

    /// When set, a request without a token is admitted with this fixed
    /// anonymous identity instead of a 401.
    #[serde(default)]
    anonymous: Option<String>,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_header_names() -> Vec<String> {
    vec!["authorization".to_string()]
}

/// Bearer-token JWT verification. On success the token subject becomes
/// the consumer's user id and is forwarded upstream as `X-User-ID`.
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
    header_names: Vec<String>,
    require_present: Vec<String>,
    anonymous: Option<String>,
}

impl JwtAuth {
    pub fn new(options: &serde_json::Value) -> Result<Self> {
        let opts: JwtAuthOptions = parse_options(options)?;

        let algorithm = match opts.algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => anyhow::bail!("jwt-auth: unsupported algorithm: {}", other),
        };

        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_exp = opts.claims_to_verify.iter().any(|c| c == "exp");
        if validation.validate_exp {
            validation.required_spec_claims.insert("exp".to_string());
        }
        validation.validate_aud = false;

        let require_present = opts
            .claims_to_verify
            .iter()
            .filter(|c| c.as_str() != "exp")
            .cloned()
            .collect();

        Ok(Self {
            key: DecodingKey::from_secret(opts.secret.as_bytes()),
            validation,
            header_names: opts.header_names,
            require_present,
            anonymous: opts.anonymous,
        })
    }

    pub fn on_access(&self, ctx: &mut RequestContext) -> PluginOutcome {
        let token = self.extract_token(ctx);

        let token = match token {
            Some(t) => t,
            None => {
                if let Some(ref anon) = self.anonymous {
                    ctx.consumer = Some(Consumer {
                        username: Some(anon.clone()),
                        ..Consumer::default()
                    });
                    return PluginOutcome::Continue;
                }
                return self.reject(ctx, GatewayError::AuthRequired("missing credentials".into()));
            }
        };

        let claims = match jsonwebtoken::decode::<serde_json::Value>(
            &token,
            &self.key,
            &self.validation,
        ) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!("jwt-auth: token rejected, reason={}", e);
                return self.reject(ctx, GatewayError::AuthInvalid("invalid token".into()));
            }
        };

        for claim in &self.require_present {
            if claims.get(claim).is_none() {
                tracing::debug!("jwt-auth: missing required claim: {}", claim);
                return self.reject(ctx, GatewayError::AuthInvalid("invalid token".into()));
            }
        }

        let sub = claims.get("sub").and_then(|v| v.as_str()).map(String::from);
        if let Some(ref sub) = sub {
            if let Ok(v) = HeaderValue::from_str(sub) {
                ctx.headers
                    .insert(HeaderName::from_static("x-user-id"), v);
            }
        }
        ctx.credential = sub.clone();
        ctx.consumer = Some(Consumer {
            user_id: sub,
            ..Consumer::default()
        });

        PluginOutcome::Continue
    }

    fn extract_token(&self, ctx: &RequestContext) -> Option<String> {
        for name in &self.header_names {
            let Some(value) = ctx.headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if let Some((scheme, rest)) = value.split_once(' ') {
                if scheme.eq_ignore_ascii_case("bearer") {
                    return Some(rest.trim().to_string());
                }
            }
        }
        None
    }

    fn reject(&self, ctx: &RequestContext, err: GatewayError) -> PluginOutcome {
        metrics::counter!(
            "gateway_plugin_short_circuits_total",
            "plugin" => "jwt-auth",
            "route" => ctx.route_name.clone(),
        )
        .increment(1);
        PluginOutcome::ShortCircuit(ctx.failure_response(&err))
    }
}
