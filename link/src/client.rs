//! Main triage-link client with builder pattern.
//!
//! The client is a cheap, cloneable handle onto the single connection task.
//! Every clone drives the same socket; the task exits once the last clone
//! is dropped or [`TriageLinkClient::shutdown`] is called.

use crate::{
    auth::{AuthTokenMonitor, CredentialStore},
    cache_sync::{CacheStore, CacheSyncBridge},
    connection::{resolve_ws_url, spawn_engine, ConnCmd, EngineConfig, EngineHandle},
    error::{Result, TriageLinkError},
    event_router::{EventRouter, Listener, ListenerHandle},
    models::{
        ConnectionOptions, ConnectionSnapshot, ConnectionState, SubscriptionAck, SubscriptionInfo,
    },
    timeouts::TriageLinkTimeouts,
    transport::{Transport, WebSocketTransport},
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Real-time sync client.
///
/// Use [`TriageLinkClientBuilder`] to construct instances.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use triage_link::{MemoryCredentialStore, TriageLinkClient};
///
/// # async fn example() -> triage_link::Result<()> {
/// let credentials = Arc::new(MemoryCredentialStore::with_token("session-token"));
/// let client = TriageLinkClient::builder()
///     .base_url("https://triage.example.com")
///     .credential_store(credentials)
///     .build()?;
///
/// client.connect()?;
/// let ack = client.subscribe("VULN-1042").await?;
/// println!("{} watching", ack.watchers.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TriageLinkClient {
    engine: EngineHandle,
    router: EventRouter,
    credentials: Arc<dyn CredentialStore>,
    timeouts: TriageLinkTimeouts,
    cache_bridge: Option<Arc<CacheSyncBridge>>,
}

impl TriageLinkClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> TriageLinkClientBuilder {
        TriageLinkClientBuilder::new()
    }

    /// Start connecting. No-op while connecting, connected or reconnecting;
    /// from `Failed` it starts over with a fresh attempt counter.
    ///
    /// Without a usable credential the call is ignored and a
    /// `connection_error` event is published.
    pub fn connect(&self) -> Result<()> {
        self.engine.send(ConnCmd::Connect)
    }

    /// Close the connection and stop reconnecting. Subscriptions are kept
    /// and re-issued on the next successful connect.
    pub fn disconnect(&self) -> Result<()> {
        self.engine.send(ConnCmd::Disconnect)
    }

    /// Stop the connection task for good. Pending requests fail with
    /// [`TriageLinkError::Cancelled`] and every listener is removed.
    pub fn shutdown(&self) {
        let _ = self.engine.send(ConnCmd::Shutdown);
    }

    /// Register `listener` for `event`. The registration lives as long as
    /// the returned handle (or until [`off`](Self::off)).
    #[must_use = "dropping the handle unregisters the listener"]
    pub fn on(&self, event: &str, listener: Listener) -> ListenerHandle {
        self.router.on(event, listener)
    }

    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        self.router.off(event, listener)
    }

    /// Send an application event. `payload` is in internal casing and is
    /// converted to wire casing before sending.
    pub async fn emit(&self, event: &str, payload: JsonValue) -> Result<()> {
        if event.trim().is_empty() {
            return Err(TriageLinkError::InvalidArgument(
                "Event name must not be empty".to_string(),
            ));
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.engine.send(ConnCmd::Emit {
            event: event.to_string(),
            payload,
            result_tx,
        })?;
        result_rx.await.map_err(|_| TriageLinkError::Cancelled)?
    }

    /// Subscribe to updates for one entity.
    ///
    /// Resolves once the server acknowledges. Subscribing to an entity that
    /// is already active resolves immediately with the last known watchers.
    /// While reconnecting the request is queued and sent after the next
    /// handshake; while disconnected it fails with
    /// [`TriageLinkError::NotConnected`].
    pub async fn subscribe(&self, entity_id: &str) -> Result<SubscriptionAck> {
        let entity_id = validate_entity_id(entity_id)?;
        let (result_tx, result_rx) = oneshot::channel();
        self.engine.send(ConnCmd::Subscribe {
            entity_id,
            result_tx,
        })?;
        result_rx.await.map_err(|_| TriageLinkError::Cancelled)?
    }

    /// Release the subscription to one entity. Unknown entities resolve
    /// immediately.
    pub async fn unsubscribe(&self, entity_id: &str) -> Result<()> {
        let entity_id = validate_entity_id(entity_id)?;
        let (result_tx, result_rx) = oneshot::channel();
        self.engine.send(ConnCmd::Unsubscribe {
            entity_id,
            result_tx,
        })?;
        result_rx.await.map_err(|_| TriageLinkError::Cancelled)?
    }

    pub async fn subscription_info(&self, entity_id: &str) -> Option<SubscriptionInfo> {
        let (result_tx, result_rx) = oneshot::channel();
        self.engine
            .send(ConnCmd::SubscriptionInfo {
                entity_id: entity_id.to_string(),
                result_tx,
            })
            .ok()?;
        result_rx.await.ok().flatten()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.snapshot().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Server-assigned socket id of the current connection.
    pub fn socket_id(&self) -> Option<String> {
        self.engine.snapshot().socket_id
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.engine.snapshot().reconnect_attempt
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.engine.snapshot()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.engine.watch()
    }

    /// `false` once the connection task has exited.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Connect and disconnect automatically as the credential store gains
    /// and loses a token. The monitor does not keep the client alive.
    pub fn spawn_token_monitor(&self) -> AuthTokenMonitor {
        AuthTokenMonitor::spawn(
            self.credentials.clone(),
            self.engine.downgrade(),
            self.timeouts.token_poll_interval,
            self.timeouts.token_settle_delay,
        )
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn cache_bridge(&self) -> Option<&Arc<CacheSyncBridge>> {
        self.cache_bridge.as_ref()
    }

    pub fn timeouts(&self) -> &TriageLinkTimeouts {
        &self.timeouts
    }
}

fn validate_entity_id(entity_id: &str) -> Result<String> {
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return Err(TriageLinkError::InvalidArgument(
            "Entity id must not be empty".to_string(),
        ));
    }
    Ok(entity_id.to_string())
}

/// Builder for [`TriageLinkClient`].
pub struct TriageLinkClientBuilder {
    base_url: Option<String>,
    credentials: Option<Arc<dyn CredentialStore>>,
    transport: Option<Arc<dyn Transport>>,
    timeouts: TriageLinkTimeouts,
    connection_options: ConnectionOptions,
    cache_bridge: Option<Arc<CacheSyncBridge>>,
    router: Option<EventRouter>,
}

impl TriageLinkClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            credentials: None,
            transport: None,
            timeouts: TriageLinkTimeouts::default(),
            connection_options: ConnectionOptions::default(),
            cache_bridge: None,
            router: None,
        }
    }

    /// HTTP(S) or WS(S) origin of the sync server
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Where the engine reads the bearer token from (required)
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Replace the WebSocket transport, e.g. with
    /// [`MemoryTransport`](crate::MemoryTransport) in tests.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set timeout configuration for all operations
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use triage_link::{MemoryCredentialStore, TriageLinkClient, TriageLinkTimeouts};
    ///
    /// # async fn example() -> triage_link::Result<()> {
    /// let client = TriageLinkClient::builder()
    ///     .base_url("http://localhost:4000")
    ///     .credential_store(Arc::new(MemoryCredentialStore::new()))
    ///     .timeouts(TriageLinkTimeouts::fast())
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn timeouts(mut self, timeouts: TriageLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Reconnect policy, dedup and key-casing settings
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Keep `store` in sync with server events using the built-in rules.
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_bridge = Some(Arc::new(CacheSyncBridge::new(store).with_default_rules()));
        self
    }

    /// Keep a cache in sync using a custom rule set.
    pub fn cache_bridge(mut self, bridge: Arc<CacheSyncBridge>) -> Self {
        self.cache_bridge = Some(bridge);
        self
    }

    /// Share an existing router instead of creating a fresh one.
    pub fn router(mut self, router: EventRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Build the client and start its connection task.
    ///
    /// Must be called from within a tokio runtime. The client starts
    /// `Disconnected`; call [`TriageLinkClient::connect`] or
    /// [`TriageLinkClient::spawn_token_monitor`].
    pub fn build(self) -> Result<TriageLinkClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| TriageLinkError::ConfigurationError("base_url is required".into()))?;
        let credentials = self.credentials.ok_or_else(|| {
            TriageLinkError::ConfigurationError("credential_store is required".into())
        })?;
        let ws_url = resolve_ws_url(&base_url, &self.connection_options.ws_path)?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TriageLinkError::ConfigurationError(
                "TriageLinkClient must be built inside a tokio runtime".into(),
            ));
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let router = self.router.unwrap_or_default();

        if let Some(bridge) = &self.cache_bridge {
            bridge.attach(&router);
        }

        log::debug!("[triage-link] Building client for {}", ws_url);
        let engine = spawn_engine(EngineConfig {
            ws_url,
            transport,
            credentials: credentials.clone(),
            options: self.connection_options,
            timeouts: self.timeouts.clone(),
            router: router.clone(),
        });

        Ok(TriageLinkClient {
            engine,
            router,
            credentials,
            timeouts: self.timeouts,
            cache_bridge: self.cache_bridge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    fn builder() -> TriageLinkClientBuilder {
        TriageLinkClient::builder()
            .base_url("http://localhost:4000")
            .credential_store(Arc::new(MemoryCredentialStore::new()))
    }

    #[tokio::test]
    async fn test_builder_pattern() {
        let client = builder().timeouts(TriageLinkTimeouts::fast()).build().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.socket_id().is_none());
        assert!(client.cache_bridge().is_none());
    }

    #[tokio::test]
    async fn test_builder_missing_url() {
        let result = TriageLinkClient::builder()
            .credential_store(Arc::new(MemoryCredentialStore::new()))
            .build();
        assert!(matches!(result, Err(TriageLinkError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_builder_missing_credentials() {
        let result = TriageLinkClient::builder().base_url("http://localhost:4000").build();
        assert!(matches!(result, Err(TriageLinkError::ConfigurationError(_))));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        assert!(builder().build().is_err());
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let client = builder().build().unwrap();
        assert!(matches!(
            client.subscribe("  ").await,
            Err(TriageLinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.emit("", JsonValue::Null).await,
            Err(TriageLinkError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_requests_while_disconnected() {
        let client = builder().build().unwrap();
        assert!(matches!(
            client.subscribe("VULN-1").await,
            Err(TriageLinkError::NotConnected)
        ));
        assert!(matches!(
            client.emit("typing", JsonValue::Null).await,
            Err(TriageLinkError::NotConnected)
        ));
        assert!(client.unsubscribe("VULN-1").await.is_ok());
        assert!(client.subscription_info("VULN-1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_task() {
        let client = builder().build().unwrap();
        client.shutdown();
        let mut state = client.watch_state();
        let _ = state.changed().await;
        tokio::task::yield_now().await;
        assert!(matches!(
            client.subscribe("VULN-1").await,
            Err(TriageLinkError::InternalError(_))
        ));
    }
}
