use http::StatusCode;
use std::fmt;

/// Request-path error taxonomy. Each kind maps to the client status the
/// gateway surfaces when the error reaches the downstream response.
#[derive(Debug)]
pub enum GatewayError {
    RouteNotFound,
    AuthRequired(String),
    AuthInvalid(String),
    Forbidden(String),
    PayloadTooLarge,
    RateLimited,
    NoHealthyTarget,
    CircuitOpen,
    UpstreamTimeout,
    UpstreamError(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::AuthRequired(_) | GatewayError::AuthInvalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoHealthyTarget | GatewayError::CircuitOpen => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message carried in the client-facing `{"error": ...}` envelope.
    /// Upstream transport detail stays out of it; `Display` keeps the
    /// full diagnostic for logs.
    pub fn client_message(&self) -> &str {
        match self {
            GatewayError::RouteNotFound => "route not found",
            GatewayError::AuthRequired(msg) | GatewayError::AuthInvalid(msg) => msg,
            GatewayError::Forbidden(msg) => msg,
            GatewayError::PayloadTooLarge => "payload too large",
            GatewayError::RateLimited => "rate limit exceeded",
            GatewayError::NoHealthyTarget | GatewayError::CircuitOpen => "no healthy upstream",
            GatewayError::UpstreamTimeout => "gateway timeout",
            GatewayError::UpstreamError(_) => "bad gateway",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RouteNotFound => write!(f, "route not found"),
            GatewayError::AuthRequired(msg) => write!(f, "authentication required: {}", msg),
            GatewayError::AuthInvalid(msg) => write!(f, "invalid credentials: {}", msg),
            GatewayError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            GatewayError::PayloadTooLarge => write!(f, "payload too large"),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::NoHealthyTarget => write!(f, "no healthy upstream target"),
            GatewayError::CircuitOpen => write!(f, "circuit breaker open"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamError(msg) => write!(f, "upstream error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::RouteNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::AuthRequired("missing token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::NoHealthyTarget.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::CircuitOpen.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::UpstreamError("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_client_message_surfaces_configured_text() {
        let err = GatewayError::Forbidden("not from this network".into());
        assert_eq!(err.client_message(), "not from this network");
        assert_eq!(err.to_string(), "forbidden: not from this network");
    }

    #[test]
    fn test_client_message_hides_upstream_detail() {
        let err = GatewayError::UpstreamError("tcp connect error: 10.0.0.1:80".into());
        assert_eq!(err.client_message(), "bad gateway");
        assert!(err.to_string().contains("10.0.0.1:80"));
    }

    #[test]
    fn test_circuit_and_pool_exhaustion_share_client_view() {
        assert_eq!(GatewayError::CircuitOpen.client_message(), "no healthy upstream");
        assert_eq!(
            GatewayError::NoHealthyTarget.client_message(),
            "no healthy upstream"
        );
    }
}
