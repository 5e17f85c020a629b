//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Stale modno on a compare-and-set write, or conflicting task state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Log store error: {0}")]
    LogStore(String),

    /// The external backup binary failed or could not be launched.
    #[error("Backup tool error: {0}")]
    Process(String),

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Map error variant to HTTP status code and machine-readable error code.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config(_) => (StatusCode::BAD_REQUEST, "CONFIG_ERROR"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Self::Database(_) | Self::Sqlx(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::LogStore(_) => (StatusCode::INTERNAL_SERVER_ERROR, "LOG_STORE_ERROR"),
            Self::Process(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BACKUP_TOOL_ERROR"),
            Self::Hook(_) => (StatusCode::INTERNAL_SERVER_ERROR, "HOOK_ERROR"),
            Self::Cancelled => (StatusCode::CONFLICT, "CANCELLED"),
            Self::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::Json(_) => (StatusCode::BAD_REQUEST, "JSON_ERROR"),
            Self::AddrParse(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ADDR_PARSE_ERROR"),
            Self::Http(_) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Return a user-facing message. Internal details are hidden for
    /// wrapped foreign errors (Sqlx, Io, etc.) to avoid leaking internals.
    fn user_message(&self) -> String {
        match self {
            Self::Sqlx(_) => "Database operation failed".to_string(),
            Self::Io(_) => "IO operation failed".to_string(),
            Self::Json(_) => "Invalid JSON".to_string(),
            Self::AddrParse(_) => "Invalid address".to_string(),
            Self::Http(_) => "Upstream HTTP request failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.user_message();

        tracing::error!(error = %self, code = code, "Request error");

        let body = Json(json!({
            "code": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
