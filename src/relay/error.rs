// Error types for relay operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of an error raised on the remote side of an exchange.
///
/// Carried inside an error wrapper payload so the initiator can rebuild the
/// same kind of failure locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteErrorKind {
    Arrowhead,
    Auth,
    BadPayload,
    InvalidParameter,
    DataNotFound,
    Timeout,
    UnavailableServer,
    Generic,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::Arrowhead => "ARROWHEAD",
            RemoteErrorKind::Auth => "AUTH",
            RemoteErrorKind::BadPayload => "BAD_PAYLOAD",
            RemoteErrorKind::InvalidParameter => "INVALID_PARAMETER",
            RemoteErrorKind::DataNotFound => "DATA_NOT_FOUND",
            RemoteErrorKind::Timeout => "TIMEOUT",
            RemoteErrorKind::UnavailableServer => "UNAVAILABLE_SERVER",
            RemoteErrorKind::Generic => "GENERIC",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while talking to a peer cloud through a relay.
///
/// A timeout is not an error: protocol calls return `Ok(None)` when the peer
/// stays silent.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or missing input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Signature failure, session mismatch or unsupported inbound message type.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Broker unreachable or the transport broke.
    #[error("Connection to relay {endpoint} failed: {reason}")]
    Connection {
        /// The `host:port` key of the broker.
        endpoint: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Key material or envelope construction failed on the sending side.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// The peer answered with an error wrapper.
    #[error("Remote {kind} error ({code}) from {origin}: {message}")]
    Remote {
        kind: RemoteErrorKind,
        code: u16,
        message: String,
        origin: String,
    },

    /// Invalid configuration file or TLS material.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub(crate) fn connection(endpoint: impl Into<String>, reason: impl fmt::Display) -> Self {
        RelayError::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Authentication failures must be treated as security events.
    pub fn is_security_event(&self) -> bool {
        matches!(self, RelayError::Authentication(_))
    }

    /// Only transport failures may be retried, and only with a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Connection { .. } | RelayError::Io(_))
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let error = RelayError::connection("relay.example.com:61616", "connection refused");
        assert_eq!(
            error.to_string(),
            "Connection to relay relay.example.com:61616 failed: connection refused"
        );
        assert!(error.is_retryable());
        assert!(!error.is_security_event());
    }

    #[test]
    fn authentication_error_is_security_event() {
        let error = RelayError::Authentication("unauthorized message on queue".to_string());
        assert!(error.is_security_event());
        assert!(!error.is_retryable());
    }

    #[test]
    fn remote_error_display() {
        let error = RelayError::Remote {
            kind: RemoteErrorKind::DataNotFound,
            code: 404,
            message: "no such service".to_string(),
            origin: "gatekeeper".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Remote DATA_NOT_FOUND error (404) from gatekeeper: no such service"
        );
    }

    #[test]
    fn remote_kind_wire_name() {
        let json = serde_json::to_string(&RemoteErrorKind::InvalidParameter).unwrap();
        assert_eq!(json, "\"INVALID_PARAMETER\"");
    }
}
