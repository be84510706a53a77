use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use thiserror::Error;

/// Message returned to every blocked client. Never carries internal detail.
pub const BLOCKED_MESSAGE: &str =
    "This request has been blocked for security reasons. If you believe this is an error, please contact support.";

/// Checkout guard error types with fail-closed response mapping
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Request blocked")]
    Blocked,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// TTL store failures. Callers on the request path treat these as "cannot read"
/// and fail open.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("TTL store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value for {key} is not a counter")]
    NotACounter { key: String },
}

/// Audit log store failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit store lock poisoned")]
    LockPoisoned,
}

impl From<&GuardError> for StatusCode {
    fn from(err: &GuardError) -> Self {
        match err {
            GuardError::Blocked => StatusCode::FORBIDDEN,
            GuardError::Unauthorized => StatusCode::UNAUTHORIZED,
            GuardError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GuardError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GuardError::ProxyError(_) => StatusCode::BAD_GATEWAY,
            GuardError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GuardError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GuardError> for StatusCode {
    fn from(err: GuardError) -> Self {
        From::from(&err)
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> axum::response::Response {
        let status: StatusCode = From::from(&self);
        match self {
            GuardError::Blocked => blocked_response(),
            GuardError::InvalidInput(msg) => (status, msg).into_response(),
            GuardError::Unauthorized => (status, "Unauthorized").into_response(),
            other => {
                tracing::error!(error = %other, "Request failed");
                let body = status.canonical_reason().unwrap_or("Error");
                (status, body).into_response()
            }
        }
    }
}

/// The fixed 403 payload sent when the decision engine blocks a request.
pub fn blocked_response() -> axum::response::Response {
    let body = json!({
        "code": "request_blocked",
        "message": BLOCKED_MESSAGE,
        "data": { "status": 403 },
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

impl From<reqwest::Error> for GuardError {
    fn from(err: reqwest::Error) -> Self {
        GuardError::ProxyError(format!("HTTP request failed: {}", err))
    }
}
