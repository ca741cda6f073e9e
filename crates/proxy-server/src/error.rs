use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub const AMBIGUOUS_TARGET_HELP: &str = "Bad Request: provide a full URL (http/https) or a domain, \
e.g., /http://example.com or /example.com";

/// Failures surfaced to HTTP clients. Each one terminates a single request
/// and is turned into a response at the handler boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request does not name a forwardable target")]
    AmbiguousTarget,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("cache key not found: {0}")]
    KeyNotFound(String),
    #[error("key parameter required")]
    MissingKey,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::AmbiguousTarget => {
                (StatusCode::BAD_REQUEST, AMBIGUOUS_TARGET_HELP).into_response()
            }
            ProxyError::UpstreamUnreachable(_) => {
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            ProxyError::KeyNotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "Item not found"})),
            )
                .into_response(),
            ProxyError::MissingKey => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Key parameter required"})),
            )
                .into_response(),
        }
    }
}
