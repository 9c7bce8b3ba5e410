//! Error types for the Nutrack bridge.
//!
//! Every failure a logical caller can observe is a variant of [`BridgeError`].
//! `ProtocolDecode` exists for the codec's own bookkeeping and is never
//! returned from a call.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Transport errors
    #[error("Backend not running: {reason}")]
    TransportUnavailable { reason: String },

    #[error("Backend request {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    #[error("{}", remote_display(.message, .status))]
    Remote {
        message: String,
        /// HTTP status code, when the HTTP transport produced the failure.
        status: Option<u16>,
        /// Application error code, when the backend supplied one.
        code: Option<String>,
    },

    #[error("Protocol decode error: {message}")]
    ProtocolDecode { message: String },

    #[error("Backend process exited with code {code:?}")]
    ChildProcessExited { code: Option<i32> },

    #[error("Request id already in flight: {request_id}")]
    DuplicateRequest { request_id: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Process errors
    #[error("Failed to launch backend {path}: {message}")]
    LaunchFailed { path: PathBuf, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn remote_display(message: &str, status: &Option<u16>) -> String {
    match status {
        Some(status) => format!("HTTP error! status: {}", status),
        None => message.to_string(),
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Build a remote error from a message the backend returned.
    pub fn remote(message: impl Into<String>) -> Self {
        BridgeError::Remote {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// HTTP status carried by a remote failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BridgeError::Remote { status, .. } => *status,
            _ => None,
        }
    }

    /// True when the failure came from the transport rather than the backend.
    ///
    /// Callers use this to distinguish "the backend said no" from "the
    /// backend could not be reached".
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportUnavailable { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::ChildProcessExited { .. }
                | BridgeError::Network { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_display_with_status() {
        let err = BridgeError::Remote {
            message: "Not Found".into(),
            status: Some(404),
            code: None,
        };
        assert_eq!(err.to_string(), "HTTP error! status: 404");
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn test_remote_display_without_status() {
        let err = BridgeError::remote("invalid barcode");
        assert_eq!(err.to_string(), "invalid barcode");
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn test_transport_failures() {
        assert!(BridgeError::Timeout {
            request_id: "abc".into(),
            after: Duration::from_secs(30),
        }
        .is_transport_failure());
        assert!(BridgeError::ChildProcessExited { code: Some(1) }.is_transport_failure());
        assert!(!BridgeError::remote("nope").is_transport_failure());
    }
}
