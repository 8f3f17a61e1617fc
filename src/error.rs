use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::models::session::{MediaKind, SessionStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaAccessError {
    #[error("Permission to use the {0} was denied")]
    PermissionDenied(MediaKind),

    #[error("No {0} device is available")]
    Unavailable(MediaKind),

    #[error("Acquiring the {0} was aborted")]
    Aborted(MediaKind),
}

impl MediaAccessError {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaAccessError::PermissionDenied(kind)
            | MediaAccessError::Unavailable(kind)
            | MediaAccessError::Aborted(kind) => *kind,
        }
    }

    pub fn guidance(&self) -> String {
        match self {
            MediaAccessError::PermissionDenied(kind) => format!(
                "Allow access to your {} in the browser's site settings, then start the test again.",
                kind
            ),
            MediaAccessError::Unavailable(kind) => format!(
                "Connect a {} device and make sure no other application is using it.",
                kind
            ),
            MediaAccessError::Aborted(kind) => {
                format!("Sharing of your {} was cancelled. Start the test again to retry.", kind)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Proctoring consent is required before starting this test")]
    ConsentRequired,

    #[error("Media access error: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("Cannot {action} while session is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    #[error("A start request is already in progress")]
    StartInProgress,

    #[error("Session has been closed")]
    SessionClosed,

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Backend returned {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Error::ConsentRequired => (
                StatusCode::BAD_REQUEST,
                "consent_required",
                Error::ConsentRequired.to_string(),
            ),
            Error::MediaAccess(err) => {
                let body = Json(json!({
                    "error": "media_access_denied",
                    "message": err.to_string(),
                    "media": err.kind(),
                    "guidance": err.guidance(),
                }));
                return (StatusCode::FORBIDDEN, body).into_response();
            }
            err @ Error::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "invalid_transition", err.to_string())
            }
            err @ Error::StartInProgress => {
                (StatusCode::CONFLICT, "start_in_progress", err.to_string())
            }
            err @ Error::SessionClosed => (StatusCode::GONE, "session_closed", err.to_string()),
            Error::Submission(msg) => {
                let body = Json(json!({
                    "error": "submission_failed",
                    "message": msg,
                    "retryable": true,
                }));
                return (StatusCode::BAD_GATEWAY, body).into_response();
            }
            err @ Error::BackendStatus { .. } => {
                (StatusCode::BAD_GATEWAY, "backend_error", err.to_string())
            }
            Error::Validation(err) => (StatusCode::BAD_REQUEST, "validation_error", err.to_string()),
            Error::Reqwest(err) => (
                StatusCode::BAD_GATEWAY,
                "backend_unreachable",
                format!("External service error: {}", err),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An unexpected error occurred".to_string(),
            ),
        };

        let body = Json(json!({ "error": code, "message": message }));
        (status, body).into_response()
    }
}
