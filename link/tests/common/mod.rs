#![allow(dead_code)]
//! In-process harness: a client wired to a [`MemoryServer`] on paused time.

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use triage_link::{
    event_names, ConnectionOptions, ConnectionState, Envelope, Listener, ListenerHandle,
    MemoryCredentialStore, MemoryServer, MemoryTransport, ServerConnection, TriageLinkClient,
    TriageLinkClientBuilder, TriageLinkTimeouts,
};

pub const BASE_URL: &str = "http://localhost:4000";
pub const TOKEN: &str = "session-token";

/// How long helpers wait before declaring a test stuck.
pub const WAIT: Duration = Duration::from_secs(120);

/// Deterministic reconnect policy: 1s, 2s, 4s ... with no jitter.
pub fn options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_reconnect_delay_ms(1000)
        .with_reconnect_growth_factor(2.0)
        .with_max_reconnect_delay_ms(30_000)
        .with_reconnect_jitter_ratio(0.0)
}

/// Heartbeats off so long sleeps do not trip the pong timeout.
pub fn timeouts() -> TriageLinkTimeouts {
    TriageLinkTimeouts::builder()
        .connection_timeout(Duration::from_secs(5))
        .handshake_timeout(Duration::from_secs(5))
        .subscribe_timeout(Duration::from_secs(3))
        .unsubscribe_timeout(Duration::from_secs(3))
        .heartbeat_interval(Duration::ZERO)
        .token_poll_interval(Duration::from_secs(1))
        .token_settle_delay(Duration::from_millis(200))
        .build()
}

pub struct Harness {
    pub client: TriageLinkClient,
    pub server: MemoryServer,
    pub credentials: Arc<MemoryCredentialStore>,
    pub events: EventLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(options(), timeouts())
    }

    pub fn with(options: ConnectionOptions, timeouts: TriageLinkTimeouts) -> Self {
        Self::build(|b| b.connection_options(options).timeouts(timeouts))
    }

    pub fn build(configure: impl FnOnce(TriageLinkClientBuilder) -> TriageLinkClientBuilder) -> Self {
        let (transport, server) = MemoryTransport::pair();
        let credentials = Arc::new(MemoryCredentialStore::with_token(TOKEN));
        let builder = TriageLinkClient::builder()
            .base_url(BASE_URL)
            .credential_store(credentials.clone())
            .transport(Arc::new(transport))
            .connection_options(options())
            .timeouts(timeouts());
        let client = configure(builder).build().expect("client builds");
        let events = EventLog::default();
        events.record(
            &client,
            &[
                event_names::CONNECT,
                event_names::DISCONNECT,
                event_names::CONNECTION_STATE_CHANGED,
                event_names::CONNECTION_ERROR,
                event_names::RECONNECT_ATTEMPT,
                event_names::SUBSCRIPTION_ERROR,
            ],
        );
        Self {
            client,
            server,
            credentials,
            events,
        }
    }

    /// `connect()`, accept the socket and complete the handshake.
    pub async fn connect(&mut self, sid: &str) -> ServerConnection {
        self.client.connect().expect("engine running");
        self.accept_and_handshake(sid).await
    }

    /// Accept the next socket the client opens and send `connect`.
    pub async fn accept_and_handshake(&mut self, sid: &str) -> ServerConnection {
        let conn = tokio::time::timeout(WAIT, self.server.accept())
            .await
            .expect("client opened a socket")
            .expect("transport alive");
        conn.send_event(event_names::CONNECT, json!({ "sid": sid }));
        wait_for_state(&self.client, ConnectionState::Connected).await;
        conn
    }

    /// States published through `connection_state_changed`, in order.
    pub fn state_history(&self) -> Vec<String> {
        self.events
            .named(event_names::CONNECTION_STATE_CHANGED)
            .iter()
            .filter_map(|p| p["state"].as_str().map(str::to_string))
            .collect()
    }
}

pub async fn wait_for_state(client: &TriageLinkClient, state: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("engine running");
}

/// Next frame from the client that is not a heartbeat.
pub async fn next_frame(conn: &mut ServerConnection) -> Envelope {
    loop {
        let envelope = tokio::time::timeout(WAIT, conn.recv_event())
            .await
            .expect("client sent a frame")
            .expect("client still connected");
        if envelope.event != event_names::PING {
            return envelope;
        }
    }
}

/// Frames already sent by the client, minus heartbeats.
pub fn drain_frames(conn: &mut ServerConnection) -> Vec<Envelope> {
    conn.drain_events()
        .into_iter()
        .filter(|e| e.event != event_names::PING)
        .collect()
}

/// Expect a `subscribe` for `entity_id` and acknowledge it.
pub async fn ack_subscribe(conn: &mut ServerConnection, entity_id: &str, watchers: JsonValue) {
    let frame = next_frame(conn).await;
    assert_eq!(frame.event, event_names::SUBSCRIBE);
    assert_eq!(frame.data["entity_id"], entity_id);
    conn.send_event(
        event_names::SUBSCRIBE_ACK,
        json!({ "entity_id": entity_id, "watchers": watchers }),
    );
}

/// Subscribe to `entity_id` and complete the ack round trip.
pub async fn subscribe_active(client: &TriageLinkClient, conn: &mut ServerConnection, id: &str) {
    let task = {
        let client = client.clone();
        let id = id.to_string();
        tokio::spawn(async move { client.subscribe(&id).await })
    };
    ack_subscribe(conn, id, json!([])).await;
    task.await.expect("task").expect("subscribe acknowledged");
}

/// Recorder for router events.
#[derive(Clone, Default)]
pub struct EventLog {
    seen: Arc<Mutex<Vec<(String, JsonValue)>>>,
    handles: Arc<Mutex<Vec<ListenerHandle>>>,
}

impl EventLog {
    pub fn record(&self, client: &TriageLinkClient, events: &[&str]) {
        for event in events {
            let seen = self.seen.clone();
            let name = event.to_string();
            let listener: Listener = Arc::new(move |payload: &JsonValue| {
                seen.lock().push((name.clone(), payload.clone()));
            });
            self.handles.lock().push(client.on(event, listener));
        }
    }

    pub fn named(&self, event: &str) -> Vec<JsonValue> {
        self.seen
            .lock()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.seen.lock().iter().filter(|(name, _)| name == event).count()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}
