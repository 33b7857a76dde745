// Error handling module
// Defines the pipeline error taxonomy and its HTTP response conversion

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the authenticated request pipeline and the relay
#[derive(Error, Debug)]
pub enum ApiError {
    /// Upstream answered with a non-2xx status other than a recoverable 401
    ///
    /// Status, headers and body are kept exactly as received.
    #[error("Upstream error: {} - {}", .status.as_u16(), String::from_utf8_lossy(.body))]
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// 401 on a request that was already replayed with a refreshed token
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Refresh failed; the stored session has been deleted
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Transport failure or timeout before any response arrived
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Relay API key missing or wrong
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Identity endpoint refused the login or sent an unusable answer
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Build a network error from a reqwest failure
    pub fn from_transport(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::Network {
            kind,
            message: e.to_string(),
        }
    }

    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Upstream { .. } => "upstream",
            ApiError::AuthExpired(_) => "auth_expired",
            ApiError::SessionExpired(_) => "session_expired",
            ApiError::Network { .. } => "network",
            ApiError::AuthError(_) => "auth",
            ApiError::LoginFailed(_) => "login_failed",
            ApiError::ValidationError(_) => "validation",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = self.kind();
        let (status, message) = match self {
            ApiError::Upstream {
                status,
                headers,
                body,
            } => {
                return crate::routes::relayed_response(status, &headers, Body::from(body));
            }
            ApiError::AuthExpired(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::SessionExpired(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Network { kind, message } => {
                let status = if kind == "timeout" {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, message)
            }
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::LoginFailed(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ApiError>;
