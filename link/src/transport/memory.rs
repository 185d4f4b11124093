//! In-process transport for driving the engine without a network.
//!
//! ```rust,no_run
//! use triage_link::MemoryTransport;
//!
//! # async fn example() {
//! let (transport, mut server) = MemoryTransport::pair();
//! // hand `transport` to the client builder, then:
//! let mut conn = server.accept().await.unwrap();
//! conn.send_event("connect", serde_json::json!({"sid": "s-1"}));
//! # }
//! ```

use super::{Incoming, Transport, WireSocket};
use crate::{
    error::{Result, TriageLinkError},
    event_router::DisconnectReason,
    models::Envelope,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    /// Outcomes forced onto the next `open` calls, oldest first
    refusals: Mutex<VecDeque<TriageLinkError>>,
    opens: AtomicUsize,
}

/// Client half: implements [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
}

/// Server half: accepts the connections the client opens.
pub struct MemoryServer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let shared = Arc::new(Shared::default());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: shared.clone(),
                accept_tx,
            },
            MemoryServer { shared, accept_rx },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str, token: &str) -> Result<Box<dyn WireSocket>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.shared.refusals.lock().pop_front() {
            return Err(err);
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let conn = ServerConnection {
            url: url.to_string(),
            token: token.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(conn)
            .map_err(|_| TriageLinkError::WebSocketError("Connection refused".to_string()))?;

        Ok(Box::new(MemorySocket {
            to_server,
            from_server,
        }))
    }
}

impl MemoryServer {
    /// Next connection opened by the client; `None` once the client side is
    /// gone.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Non-blocking variant of [`accept`](Self::accept).
    pub fn try_accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.try_recv().ok()
    }

    /// Fail the next `open` with `err` (queued; one refusal per call).
    pub fn refuse_next(&self, err: TriageLinkError) {
        self.shared.refusals.lock().push_back(err);
    }

    /// How many times the client tried to open a socket.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

enum ServerFrame {
    Text(String),
    Close(DisconnectReason),
}

/// Server view of one accepted connection. Dropping it looks like the
/// network vanishing.
pub struct ServerConnection {
    url: String,
    token: String,
    to_client: mpsc::UnboundedSender<ServerFrame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Push a raw text frame. Returns `false` if the client hung up.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(ServerFrame::Text(text.into())).is_ok()
    }

    /// Push `{"event": name, "data": data}`.
    pub fn send_event(&self, event: &str, data: JsonValue) -> bool {
        match serde_json::to_string(&Envelope::new(event, data)) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Close the connection the way a server would.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        self.to_client.send(ServerFrame::Close(reason)).is_ok()
    }

    /// Next raw frame from the client; `None` once it closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame from the client decoded as an envelope. Frames that are
    /// not envelopes are skipped.
    pub async fn recv_event(&mut self) -> Option<Envelope> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                return Some(envelope);
            }
        }
    }

    /// Every envelope already received, without waiting.
    pub fn drain_events(&mut self) -> Vec<Envelope> {
        let mut events = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                events.push(envelope);
            }
        }
        events
    }

    /// `true` once the client dropped its socket.
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }
}

struct MemorySocket {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
impl WireSocket for MemorySocket {
    async fn send(&mut self, text: String) -> Result<()> {
        self.to_server
            .send(text)
            .map_err(|_| TriageLinkError::WebSocketError("Peer went away".to_string()))
    }

    async fn recv(&mut self) -> Result<Incoming> {
        match self.from_server.recv().await {
            Some(ServerFrame::Text(text)) => Ok(Incoming::Text(text)),
            Some(ServerFrame::Close(reason)) => Ok(Incoming::Closed(reason)),
            None => Err(TriageLinkError::WebSocketError("Connection reset".to_string())),
        }
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}
