//! Error types for the application

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::NotFound(e) => (StatusCode::NOT_FOUND, e.clone()),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
            AppError::Forbidden(e) => (StatusCode::FORBIDDEN, e.clone()),
            AppError::Timeout(e) => {
                tracing::error!("Timeout: {}", e);
                (StatusCode::GATEWAY_TIMEOUT, e.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.clone())
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Rejections produced while handling a websocket event.
///
/// Each variant maps to a stable `code` that is sent to the originating
/// connection in an `error` event. None of these close the connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Message needs content or at least one attachment")]
    EmptyMessage,

    #[error("Not a member of room {0}")]
    NotInRoom(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Workspace is {size} bytes, limit is {limit}")]
    WorkspaceTooLarge { size: u64, limit: u64 },

    #[error(transparent)]
    App(#[from] AppError),
}

impl SessionError {
    /// Wire code for the `error` event
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidPayload(_) => "invalid_payload",
            SessionError::EmptyMessage => "empty_message",
            SessionError::NotInRoom(_) => "not_in_room",
            SessionError::NotFound(_) | SessionError::App(AppError::NotFound(_)) => "not_found",
            SessionError::Forbidden(_) | SessionError::App(AppError::Forbidden(_)) => "forbidden",
            SessionError::WorkspaceTooLarge { .. } => "workspace_too_large",
            SessionError::App(AppError::Timeout(_)) => "timeout",
            SessionError::App(_) => "internal",
        }
    }
}
