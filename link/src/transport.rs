//! Socket seam between the connection task and the network.
//!
//! The connection task only ever sees text frames and a close signal.
//! [`WebSocketTransport`] is the production implementation;
//! [`MemoryTransport`] is an in-process pair used by tests.

mod memory;
mod websocket;

pub use memory::{MemoryServer, MemoryTransport, ServerConnection};
pub use websocket::WebSocketTransport;

use crate::{error::Result, event_router::DisconnectReason};
use async_trait::async_trait;

/// What one read from the socket produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// One text frame
    Text(String),
    /// The peer closed the connection
    Closed(DisconnectReason),
}

/// Opens authenticated sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `url` presenting `token` as a bearer credential.
    ///
    /// Rejections of the credential itself must be reported as
    /// [`AuthenticationError`](crate::TriageLinkError::AuthenticationError)
    /// so the engine does not retry them.
    async fn open(&self, url: &str, token: &str) -> Result<Box<dyn WireSocket>>;
}

/// One open, bidirectional text socket.
///
/// `recv` must be cancel-safe: the connection task drops the future
/// whenever another `select!` branch wins.
#[async_trait]
pub trait WireSocket: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    async fn recv(&mut self) -> Result<Incoming>;

    /// Best-effort close; errors are swallowed.
    async fn close(&mut self);
}
