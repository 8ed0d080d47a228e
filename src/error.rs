//! Error types for octogate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for octogate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for octogate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Token refresh failed for account '{account}': {reason}")]
    Token { account: String, reason: String },

    /// Every candidate provider was skipped or failed. Carries the last
    /// recorded reason per provider so the 503 body is debuggable.
    #[error("No provider available")]
    NoProviderAvailable { reasons: Vec<(String, String)> },

    /// Upstream returned a non-failover status; passed through verbatim.
    #[error("Upstream returned {status}")]
    UpstreamHttp { status: u16, body: String },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid master key")]
    Unauthorized,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            // Verbatim passthrough of the upstream status and body.
            Error::UpstreamHttp { status, body } => Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),

            Error::NoProviderAvailable { reasons } => {
                let providers: serde_json::Map<String, serde_json::Value> = reasons
                    .into_iter()
                    .map(|(name, reason)| (name, serde_json::Value::String(reason)))
                    .collect();
                let body = serde_json::json!({
                    "error": {
                        "message": "No provider available to fulfill the request",
                        "type": "no_provider_available",
                        "code": 503,
                        "providers": providers,
                    }
                });
                (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
            }

            other => {
                let status = match &other {
                    Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    Error::Token { .. } => StatusCode::BAD_GATEWAY,
                    Error::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
                    Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    Error::BadRequest(_) => StatusCode::BAD_REQUEST,
                    Error::Unauthorized => StatusCode::UNAUTHORIZED,
                    Error::UpstreamHttp { .. } | Error::NoProviderAvailable { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                // OpenAI-compatible error format
                let body = serde_json::json!({
                    "error": {
                        "message": other.to_string(),
                        "type": "octogate_error",
                        "code": status.as_u16()
                    }
                });
                (status, axum::Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_http_passes_status_through() {
        let err = Error::UpstreamHttp {
            status: 422,
            body: r#"{"error":{"message":"bad params"}}"#.to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn no_provider_available_is_503() {
        let err = Error::NoProviderAvailable {
            reasons: vec![("github-copilot#1".to_string(), "disabled".to_string())],
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn timeout_is_504() {
        let response = Error::Timeout.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn unauthorized_is_401() {
        let response = Error::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
