use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// States of the connection state machine.
///
/// ```text
/// Disconnected --connect()--> Connecting --ok--> Connected
///      ^                          |                  |
///      |                        fail            drop / stale
///      |                          v                  v
///      +---- auth rejected --- Reconnecting <--------+
///                                 |
///                          attempts exhausted
///                                 v
///                               Failed --connect()--> Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// `true` while a connection attempt is in flight or established.
    ///
    /// `connect()` is a no-op in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the singleton connection.
///
/// Only the connection task writes it; everyone else reads the latest value
/// through the client's watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Assigned by the server on handshake, cleared on disconnect
    pub socket_id: Option<String>,
    /// Retries since the last successful connect
    pub reconnect_attempt: u32,
    pub last_heartbeat_sent_at: Option<Instant>,
    pub last_heartbeat_ack_at: Option<Instant>,
}
