use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SessionId, UploadState};

/// Result type for orchestrator operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors returned by the orchestrator API itself.
///
/// Failures that happen *inside* a running session are never returned from
/// these calls; they are recorded on the session and delivered to subscribers
/// as a [`SessionError`](crate::SessionError).
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("An upload session is already active: {session_id}")]
    Busy { session_id: SessionId },

    #[error("Upload session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Cannot {operation} session {session_id} while it is {state}")]
    InvalidState {
        session_id: SessionId,
        state: UploadState,
        operation: &'static str,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a session-not-found error
    pub fn session_not_found(session_id: &SessionId) -> Self {
        Self::SessionNotFound {
            session_id: session_id.clone(),
        }
    }

    /// Create an invalid-state error for `operation`
    pub fn invalid_state(
        session_id: &SessionId,
        state: UploadState,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            session_id: session_id.clone(),
            state,
            operation,
        }
    }
}

/// Failure raised by a [`TransportClient`](crate::TransportClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error(
        "Server error{}: {message}",
        .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
    )]
    Server { status: Option<u16>, message: String },
}

impl TransportError {
    /// Create a network error (connection, DNS, dropped stream...)
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a server error, optionally carrying the HTTP status
    pub fn server<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Session error kind this failure maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::Server { .. } => ErrorKind::ServerError,
        }
    }
}

/// Why a candidate file was rejected before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported file type {mime_type:?}: expected {expected_prefix}*")]
    InvalidType {
        mime_type: String,
        expected_prefix: String,
    },

    #[error("File is too large: {size_bytes} bytes (max: {max_bytes})")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
}

/// Why the duration probe could not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Failed to fetch audio: {0}")]
    Fetch(String),

    #[error("Failed to decode audio: {0}")]
    Decode(String),

    #[error("Audio stream does not expose a duration")]
    UnknownDuration,
}

/// Session error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad MIME type or size, rejected before any network call
    InvalidInput,
    /// Upload deadline elapsed before the transfer settled
    Timeout,
    /// Transport could not reach the backend
    NetworkError,
    /// Backend answered with a failure
    ServerError,
    /// Public URL never became available
    ResolutionError,
}

impl ErrorKind {
    /// Whether `retry()` may re-enter the upload phase after this error.
    ///
    /// `InvalidInput` has no validated file to reuse.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidInput)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::ServerError => "server_error",
            Self::ResolutionError => "resolution_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_kinds() {
        assert_eq!(TransportError::network("reset").kind(), ErrorKind::NetworkError);
        assert_eq!(TransportError::server(Some(503), "busy").kind(), ErrorKind::ServerError);
    }

    #[test]
    fn test_server_error_message_includes_status() {
        let err = TransportError::server(Some(502), "bad gateway");
        assert_eq!(err.to_string(), "Server error (HTTP 502): bad gateway");

        let err = TransportError::server(None, "mutation failed");
        assert_eq!(err.to_string(), "Server error: mutation failed");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(ErrorKind::ResolutionError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
    }
}
