//! Error types for triage-link.
//!
//! The engine never panics across its public API. Every fallible operation
//! returns [`Result`], and the variants below tell callers whether retrying
//! can help.

use thiserror::Error;

/// Result type for triage-link operations
pub type Result<T> = std::result::Result<T, TriageLinkError>;

/// Errors surfaced by the synchronization engine
#[derive(Debug, Clone, Error)]
pub enum TriageLinkError {
    /// The server (or the local credential check) rejected the credential
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Invalid client configuration (bad URL, malformed header value, ...)
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A bounded wait (connect, handshake) elapsed
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Payload could not be encoded or decoded as JSON
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Transport-level failure (refused, reset, closed mid-handshake)
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Frame did not follow the wire protocol
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server did not acknowledge a subscribe/unsubscribe in time
    #[error("{operation} for entity '{entity_id}' was not acknowledged in time")]
    SubscriptionTimeout {
        entity_id: String,
        operation: &'static str,
    },

    /// The server acknowledged the request with an error
    #[error("Subscription to entity '{entity_id}' rejected: {message}")]
    SubscriptionRejected { entity_id: String, message: String },

    /// Outbound traffic requested while no connection is open
    #[error("Not connected")]
    NotConnected,

    /// Programmer error: an argument was rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The pending operation was abandoned by teardown or a competing call
    #[error("Operation cancelled")]
    Cancelled,

    /// The engine task is gone or an invariant broke
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TriageLinkError {
    /// `true` when the failure stems from the credential itself.
    ///
    /// The connection task stops retrying on these instead of entering the
    /// backoff loop.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::AuthenticationError(_))
    }

    /// `true` when automatic reconnection may resolve the failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TimeoutError(_) | Self::WebSocketError(_) | Self::ProtocolError(_)
        )
    }
}

impl From<serde_json::Error> for TriageLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TriageLinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocketError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TriageLinkError::AuthenticationError("expired".into()).is_auth_error());
        assert!(!TriageLinkError::AuthenticationError("expired".into()).is_recoverable());
        assert!(TriageLinkError::WebSocketError("reset".into()).is_recoverable());
        assert!(TriageLinkError::TimeoutError("handshake".into()).is_recoverable());
        assert!(!TriageLinkError::Cancelled.is_recoverable());
        assert!(!TriageLinkError::ConfigurationError("bad header".into()).is_recoverable());
    }

    #[test]
    fn test_subscription_timeout_display() {
        let err = TriageLinkError::SubscriptionTimeout {
            entity_id: "VULN-7".into(),
            operation: "subscribe",
        };
        assert_eq!(
            err.to_string(),
            "subscribe for entity 'VULN-7' was not acknowledged in time"
        );
    }
}
