//! # Error Handling
//!
//! This module defines the error taxonomy shared by the voice client and the relay server,
//! and how those errors are turned into HTTP responses and user-facing status lines.
//!
//! ## Error Categories:
//! - **Format**: a frame or patch could not be decoded. Recovered locally: the offending
//!   item is dropped and the conversation continues.
//! - **Device**: microphone or speaker unavailable. Fatal to the session, no retry.
//! - **Transport**: the socket closed unexpectedly or the remote side sent an error.
//!   Fatal to the session, no automatic reconnect.
//! - **Timeout**: the hard session cap was reached. A graceful forced termination.
//! - **InvalidState**: an operation was attempted on a frozen session.
//! - **Config / BadRequest / Internal**: relay server and startup problems.
//!
//! ## Propagation Policy:
//! Codec and classifier errors never leave the event loop. Device and transport errors
//! terminate the session and produce exactly one human-readable status message.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error type for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Format("odd byte length".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Malformed byte lengths, bad base64, malformed patch JSON
    Format(String),

    /// Microphone or output device unavailable or failed
    Device(String),

    /// Socket closed unexpectedly or explicit error from the remote side
    Transport(String),

    /// Hard session duration cap reached
    Timeout(String),

    /// Mutation attempted on a session that already reached a terminal state
    InvalidState(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Client sent invalid data to the relay's HTTP API
    BadRequest(String),

    /// Anything else
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Format(msg) => write!(f, "Format error: {}", msg),
            AppError::Device(msg) => write!(f, "Device error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether this error ends the current voice session.
    ///
    /// Format errors are recovered by skipping the offending frame or patch.
    /// Timeouts end the session but are not failures, see [`AppError::is_failure`].
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::Format(_) | AppError::InvalidState(_))
    }

    /// Whether this error should be reported as a failure rather than a normal ending.
    pub fn is_failure(&self) -> bool {
        self.is_fatal() && !matches!(self, AppError::Timeout(_))
    }

    /// The single human-readable line shown to the user for a fatal condition.
    pub fn status_message(&self) -> String {
        match self {
            AppError::Device(msg) => format!(
                "Could not access your audio device ({}). Check that a microphone and speaker are connected.",
                msg
            ),
            AppError::Transport(msg) => format!("Connection to the assessment agent was lost: {}", msg),
            AppError::Timeout(_) => {
                "The session reached its maximum length and has been ended.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Converts errors into HTTP responses for the relay's API.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type) = match self {
            AppError::BadRequest(_) | AppError::Format(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            AppError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport_error"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::Device(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON problems are almost always malformed input (a patch, a wire message, a request body).
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Format(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Format(format!("invalid base64 frame: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<cpal::DevicesError> for AppError {
    fn from(err: cpal::DevicesError) -> Self {
        AppError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AppError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AppError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AppError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AppError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AppError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AppError::Device(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(format!("HTTP request failed: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(!AppError::Format("x".into()).is_fatal());
        assert!(AppError::Device("x".into()).is_fatal());
        assert!(AppError::Transport("x".into()).is_failure());
        // A timeout ends the session but is not a failure
        assert!(AppError::Timeout("x".into()).is_fatal());
        assert!(!AppError::Timeout("x".into()).is_failure());
    }

    #[test]
    fn test_status_message_is_human_readable() {
        let msg = AppError::Device("no default input device".into()).status_message();
        assert!(msg.contains("no default input device"));
        assert!(msg.contains("microphone"));
    }

    #[test]
    fn test_json_errors_become_format_errors() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err().into();
        assert!(matches!(err, AppError::Format(_)));
    }
}
