//! # Error Handling
//!
//! This module defines two error families:
//! - **VoiceError**: failures inside the real-time voice core (capture, session,
//!   playback, lifecycle). Each variant belongs to one category of the
//!   containment policy: fatal categories surface to the user, the rest are
//!   logged and contained where they are detected.
//! - **AppError**: failures of the HTTP control surface, converted into JSON
//!   error responses.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Result<T, E>**: every fallible operation says so in its signature
//! - **Enums for error types**: one variant per failure category, each carrying a message
//! - **From trait**: lets `?` convert between error types automatically
//! - **ResponseError trait**: turns an error into an HTTP response

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failure categories of the real-time voice core.
///
/// ## Containment policy:
/// - **Fatal** (user-visible, session attempt ends): `PermissionDenied`,
///   `DeviceUnavailable`, `SessionOpenFailure`, `SessionClosedUnexpectedly`,
///   `MissingCredential`
/// - **Contained** (logged, sibling work continues): `SendFailure`,
///   `DecodePayloadFailure`, `CloseError`
///
/// Nothing in the core retries automatically; a retry is a new start request.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Microphone acquisition was refused by the user or the host
    PermissionDenied(String),

    /// No usable capture device, or an audio context could not be created
    DeviceUnavailable(String),

    /// The remote session could not be opened (network, auth, timeout)
    SessionOpenFailure(String),

    /// An outbound frame could not be handed to the session (transient)
    SendFailure(String),

    /// One inbound audio payload could not be decoded (per-unit)
    DecodePayloadFailure(String),

    /// The remote side closed or failed while the session was live
    SessionClosedUnexpectedly(String),

    /// Releasing a resource during teardown failed (always swallowed)
    CloseError(String),

    /// No credential configured, so the voice core is unreachable
    MissingCredential,

    /// A request arrived in a lifecycle state that cannot serve it
    InvalidState(String),

    /// Anything else (channel closed, task gone)
    Internal(String),
}

impl VoiceError {
    /// Whether this error ends the session attempt and is shown to the user.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_)
                | VoiceError::DeviceUnavailable(_)
                | VoiceError::SessionOpenFailure(_)
                | VoiceError::SessionClosedUnexpectedly(_)
                | VoiceError::MissingCredential
                | VoiceError::Internal(_)
        )
    }

    /// Machine-readable tag used in status payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => "permission_denied",
            VoiceError::DeviceUnavailable(_) => "device_unavailable",
            VoiceError::SessionOpenFailure(_) => "session_open_failure",
            VoiceError::SendFailure(_) => "send_failure",
            VoiceError::DecodePayloadFailure(_) => "decode_payload_failure",
            VoiceError::SessionClosedUnexpectedly(_) => "session_closed_unexpectedly",
            VoiceError::CloseError(_) => "close_error",
            VoiceError::MissingCredential => "missing_credential",
            VoiceError::InvalidState(_) => "invalid_state",
            VoiceError::Internal(_) => "internal_error",
        }
    }

    /// Text for the user-visible error state.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::PermissionDenied(_) => {
                "Microphone permission was denied. Allow microphone access and try again.".to_string()
            }
            VoiceError::DeviceUnavailable(msg) => format!("Audio device unavailable: {}", msg),
            VoiceError::SessionOpenFailure(msg) => format!("Could not connect to the tutor: {}", msg),
            VoiceError::SessionClosedUnexpectedly(_) => "Disconnected from the tutor.".to_string(),
            VoiceError::MissingCredential => "No API key configured.".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            VoiceError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            VoiceError::SessionOpenFailure(msg) => write!(f, "Session open failed: {}", msg),
            VoiceError::SendFailure(msg) => write!(f, "Send failed: {}", msg),
            VoiceError::DecodePayloadFailure(msg) => write!(f, "Payload decode failed: {}", msg),
            VoiceError::SessionClosedUnexpectedly(msg) => write!(f, "Session closed unexpectedly: {}", msg),
            VoiceError::CloseError(msg) => write!(f, "Close error: {}", msg),
            VoiceError::MissingCredential => write!(f, "Missing credential"),
            VoiceError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            VoiceError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Shorthand for results produced by the voice core.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Error types for the HTTP control surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Conflict**: Request not valid in the engine's current state (409 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (engine task gone, channel closed, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// The engine cannot serve this request right now
    Conflict(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "message": "session already running",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                actix_web::http::StatusCode::CONFLICT,  // 409
                "conflict",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Maps voice core failures onto HTTP categories.
///
/// ## Mapping:
/// - Missing credential → 400 (the client must configure a key first)
/// - Invalid lifecycle state → 409
/// - Everything else → 500
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::MissingCredential => AppError::BadRequest(err.user_message()),
            VoiceError::InvalidState(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client,
/// so they become 400 responses rather than 500s.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
