//! Error types for the LevelUp call session.
//!
//! This module defines the error hierarchy for session operations, including
//! configuration loading, call lifecycle preconditions, voice engine failures,
//! and backend lookups made by the post-call redirector.

use std::path::PathBuf;

use levelup_client::ClientError;

/// A specialized `Result` type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// User-facing message when the engine rejects the start command.
pub const START_FAILED_MESSAGE: &str = "Failed to start the interview. Please try again.";

/// User-facing message when the connecting watchdog fires.
pub const CONNECT_TIMEOUT_MESSAGE: &str = "Connection attempt timed out. Please try again.";

/// User-facing message when the engine rejects the stop command.
pub const STOP_FAILED_MESSAGE: &str = "Failed to stop the interview properly.";

/// Errors that can occur while driving a call session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your levelup.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// A start was requested while a call is already outstanding.
    #[error("Session is busy ({status})\n\nSuggestion: End the current call before starting another")]
    SessionBusy {
        /// Status the session was in.
        status: String,
    },

    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    // ========================================================================
    // Voice Engine Errors
    // ========================================================================
    /// The engine rejected the start command.
    #[error("Failed to start the interview: {message}")]
    StartFailed {
        /// Engine-provided reason.
        message: String,
    },

    /// The engine did not acknowledge the start command in time.
    #[error("Start command timed out after {timeout_secs}s\n\nSuggestion: Check your network connection and the voice gateway URL")]
    StartTimeout {
        /// The timeout in seconds.
        timeout_secs: u64,
    },

    /// The engine rejected the stop command.
    #[error("Failed to stop the interview: {message}")]
    StopFailed {
        /// Engine-provided reason.
        message: String,
    },

    /// The engine connection itself failed.
    #[error("Voice engine error: {message}")]
    Engine {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// A backend request failed.
    #[error(transparent)]
    Backend(#[from] ClientError),

    // ========================================================================
    // General Errors
    // ========================================================================
    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `SessionBusy` error.
    #[must_use]
    pub fn session_busy(status: impl std::fmt::Display) -> Self {
        Self::SessionBusy {
            status: status.to_string(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a new `StartFailed` error.
    #[must_use]
    pub fn start_failed(message: impl Into<String>) -> Self {
        Self::StartFailed {
            message: message.into(),
        }
    }

    /// Creates a new `StopFailed` error.
    #[must_use]
    pub fn stop_failed(message: impl Into<String>) -> Self {
        Self::StopFailed {
            message: message.into(),
        }
    }

    /// Creates a new `Engine` error.
    #[must_use]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is transient and the user may retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StartFailed { .. }
            | Self::StartTimeout { .. }
            | Self::StopFailed { .. }
            | Self::Engine { .. } => true,
            Self::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Message to surface in the session's `last_error`.
    ///
    /// Start and stop failures collapse to fixed, friendly sentences; the
    /// underlying reason only goes to the log.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::StartFailed { .. } | Self::StartTimeout { .. } => {
                START_FAILED_MESSAGE.to_string()
            }
            Self::StopFailed { .. } => STOP_FAILED_MESSAGE.to_string(),
            Self::Engine { message } => format!("An error occurred: {message}"),
            other => other.to_string(),
        }
    }

    /// Returns `true` if the error is a precondition failure rather than a
    /// fault, i.e. the caller asked for something the session cannot do now.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::SessionBusy { .. } | Self::InvalidStateTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = SessionError::session_busy("active");
        let msg = err.to_string();
        assert!(msg.contains("busy"));
        assert!(msg.contains("active"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_user_message_hides_engine_detail() {
        let err = SessionError::start_failed("socket closed");
        assert_eq!(err.user_message(), START_FAILED_MESSAGE);
        assert!(err.to_string().contains("socket closed"));

        let timeout = SessionError::StartTimeout { timeout_secs: 15 };
        assert_eq!(timeout.user_message(), START_FAILED_MESSAGE);

        let stop = SessionError::stop_failed("already closed");
        assert_eq!(stop.user_message(), STOP_FAILED_MESSAGE);

        let engine = SessionError::engine("mic unavailable");
        assert_eq!(engine.user_message(), "An error occurred: mic unavailable");
    }

    #[test]
    fn test_is_transient() {
        assert!(SessionError::start_failed("x").is_transient());
        assert!(SessionError::StartTimeout { timeout_secs: 15 }.is_transient());
        assert!(!SessionError::session_busy("connecting").is_transient());
        assert!(!SessionError::config_validation("bad", "fix it").is_transient());
    }

    #[test]
    fn test_is_precondition() {
        assert!(SessionError::session_busy("active").is_precondition());
        assert!(SessionError::invalid_transition("idle", "ending").is_precondition());
        assert!(!SessionError::start_failed("x").is_precondition());
    }

    #[test]
    fn test_from_client_error() {
        let err: SessionError = ClientError::TokenExpired.into();
        assert!(matches!(err, SessionError::Backend(ClientError::TokenExpired)));
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SessionError = io_err.into();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
