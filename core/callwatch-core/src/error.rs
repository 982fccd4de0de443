//! Error types for callwatch-core operations.

use std::path::PathBuf;

use callwatch_protocol::ErrorInfo;

/// All errors that can occur in callwatch-core operations.
///
/// Event processing never returns these: malformed pushes and stale acks are
/// logged and dropped. Errors are reserved for operations a caller initiates.
#[derive(Debug, thiserror::Error)]
pub enum CallwatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration read failed: {path}: {source}")]
    ConfigReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration value for {field}: {details}")]
    ConfigInvalid { field: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Credential is not a three-part dotted token")]
    MalformedToken,

    #[error("Push channel is not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(ErrorInfo),

    // ─────────────────────────────────────────────────────────────────────
    // Call Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Call not found: {0}")]
    CallNotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Escalation Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No open escalation for call {0}")]
    EscalationNotFound(String),

    #[error("Escalation answer rejected: {0}")]
    InvalidResolution(String),

    // ─────────────────────────────────────────────────────────────────────
    // Availability Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("An operator status change is already in flight")]
    StatusChangeInFlight,

    #[error("Operator status request failed: {0}")]
    StatusRequestFailed(String),
}

impl From<ErrorInfo> for CallwatchError {
    fn from(info: ErrorInfo) -> Self {
        CallwatchError::Protocol(info)
    }
}

/// Result type alias for callwatch-core operations.
pub type Result<T> = std::result::Result<T, CallwatchError>;
