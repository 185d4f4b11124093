//! # triage-link
//!
//! Real-time synchronization engine for the Triage vulnerability tracker.
//!
//! One authenticated WebSocket per client carries every server push:
//! entity changes, comment threads, reactions, watcher presence and
//! background job progress. The engine keeps that socket alive across
//! network loss and credential changes and feeds a local cache.
//!
//! ## Features
//!
//! - **Connection state machine**: `disconnected`, `connecting`,
//!   `connected`, `reconnecting` and `failed`, with jittered exponential
//!   backoff between attempts
//! - **Credential awareness**: [`AuthTokenMonitor`] connects on sign-in
//!   and disconnects on sign-out; expired JWTs are never dialed
//! - **Heartbeats**: application-level ping/pong detects stale sockets
//! - **Per-entity subscriptions**: acknowledged, idempotent, and re-issued
//!   after every reconnect
//! - **Normalization and dedup**: wire `snake_case` keys become
//!   `camelCase`, and repeated low-value events are dropped
//! - **Cache sync**: [`CacheSyncBridge`] merges or invalidates cache
//!   entries as events arrive
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use triage_link::{event_names, Listener, MemoryCredentialStore, TriageLinkClient};
//!
//! # async fn example() -> triage_link::Result<()> {
//! let credentials = Arc::new(MemoryCredentialStore::with_token("session-token"));
//! let client = TriageLinkClient::builder()
//!     .base_url("https://triage.example.com")
//!     .credential_store(credentials)
//!     .build()?;
//!
//! let on_update: Listener = Arc::new(|payload: &serde_json::Value| {
//!     println!("entity changed: {}", payload["entityId"]);
//! });
//! let _handle = client.on(event_names::ENTITY_UPDATED, on_update);
//!
//! let _monitor = client.spawn_token_monitor();
//! client.subscribe("VULN-1042").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache_sync;
pub mod client;
mod connection;
pub mod dedup;
pub mod error;
pub mod event_router;
pub mod heartbeat;
pub mod models;
pub mod normalize;
mod subscription;
pub mod timeouts;
pub mod transport;

pub use auth::{token_status, AuthTokenMonitor, CredentialStore, MemoryCredentialStore, TokenStatus};
pub use cache_sync::{CacheKey, CacheStore, CacheSyncBridge, SyncOutcome, SyncRule};
pub use client::{TriageLinkClient, TriageLinkClientBuilder};
pub use dedup::DeduplicationCache;
pub use error::{Result, TriageLinkError};
pub use event_router::{ConnectionError, DisconnectReason, EventRouter, Listener, ListenerHandle};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use models::{
    event_names, ConnectionOptions, ConnectionSnapshot, ConnectionState, Envelope,
    SubscriptionAck, SubscriptionInfo, SubscriptionStatus,
};
pub use normalize::{CaseNormalizer, KeyCase};
pub use timeouts::{TriageLinkTimeouts, TriageLinkTimeoutsBuilder};
pub use transport::{
    Incoming, MemoryServer, MemoryTransport, ServerConnection, Transport, WebSocketTransport,
    WireSocket,
};
