//! The connection task.
//!
//! A single background task owns the socket, the subscription registry, the
//! heartbeat and the dedup memo. Everything else talks to it through
//! [`ConnCmd`]s and reads its state from a watch channel, so no lock is ever
//! held across an await.

use super::{encode_frame, is_auth_disconnect, jittered_backoff, parse_frame, FAR_FUTURE};
use crate::{
    auth::{usable_token, CredentialStore},
    dedup::DeduplicationCache,
    error::{Result, TriageLinkError},
    event_router::{ConnectionError, DisconnectReason, EventRouter},
    heartbeat::{HeartbeatAction, HeartbeatMonitor},
    models::{
        event_names, ConnectionOptions, ConnectionSnapshot, ConnectionState, SubscriptionInfo,
    },
    normalize::CaseNormalizer,
    subscription::{
        entity_id_of, watchers_of, SubscribeReply, SubscriptionRegistry, UnsubscribeReply,
    },
    timeouts::TriageLinkTimeouts,
    transport::{Incoming, Transport, WireSocket},
};
use serde_json::{json, Value as JsonValue};
use std::{ops::ControlFlow, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;

/// Commands sent from the client handle to the connection task.
pub(crate) enum ConnCmd {
    Connect,
    Disconnect,
    Emit {
        event: String,
        payload: JsonValue,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        entity_id: String,
        result_tx: SubscribeReply,
    },
    Unsubscribe {
        entity_id: String,
        result_tx: UnsubscribeReply,
    },
    SubscriptionInfo {
        entity_id: String,
        result_tx: oneshot::Sender<Option<SubscriptionInfo>>,
    },
    Shutdown,
}

/// Everything the task needs, resolved by the client builder.
pub(crate) struct EngineConfig {
    pub ws_url: String,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub options: ConnectionOptions,
    pub timeouts: TriageLinkTimeouts,
    pub router: EventRouter,
}

/// Owning handle to the connection task. The task exits once every handle
/// is dropped or [`ConnCmd::Shutdown`] is received.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionSnapshot>,
}

impl EngineHandle {
    pub fn send(&self, cmd: ConnCmd) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| {
            TriageLinkError::InternalError("Connection task is not running".to_string())
        })
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            cmd_tx: self.cmd_tx.downgrade(),
        }
    }
}

/// Non-owning handle used by background helpers such as the token monitor,
/// so they never keep the connection task alive on their own.
#[derive(Clone)]
pub(crate) struct WeakEngine {
    cmd_tx: mpsc::WeakUnboundedSender<ConnCmd>,
}

impl WeakEngine {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: &mpsc::UnboundedSender<ConnCmd>) -> Self {
        Self {
            cmd_tx: tx.downgrade(),
        }
    }

    /// Returns `false` once the connection task is gone.
    pub fn connect(&self) -> bool {
        self.send(ConnCmd::Connect)
    }

    /// Returns `false` once the connection task is gone.
    pub fn disconnect(&self) -> bool {
        self.send(ConnCmd::Disconnect)
    }

    fn send(&self, cmd: ConnCmd) -> bool {
        match self.cmd_tx.upgrade() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

/// Start the connection task. Must be called from within a tokio runtime.
pub(crate) fn spawn_engine(config: EngineConfig) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::default());
    let engine = Engine::new(config, state_tx);
    tokio::spawn(engine.run(cmd_rx));
    EngineHandle { cmd_tx, state_rx }
}

type CmdRx = mpsc::UnboundedReceiver<ConnCmd>;

struct Engine {
    ws_url: String,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    options: ConnectionOptions,
    timeouts: TriageLinkTimeouts,
    router: EventRouter,
    normalizer: CaseNormalizer,
    dedup: DeduplicationCache,
    heartbeat: HeartbeatMonitor,
    registry: SubscriptionRegistry,
    snapshot: ConnectionSnapshot,
    state_tx: watch::Sender<ConnectionSnapshot>,
    socket: Option<Box<dyn WireSocket>>,
    /// When the next reconnect attempt may start; only set while
    /// `Reconnecting` and waiting out the backoff
    retry_at: Option<TokioInstant>,
}

impl Engine {
    fn new(config: EngineConfig, state_tx: watch::Sender<ConnectionSnapshot>) -> Self {
        let EngineConfig {
            ws_url,
            transport,
            credentials,
            options,
            timeouts,
            router,
        } = config;

        let normalizer = CaseNormalizer::new(
            options.wire_case,
            options.internal_case,
            options.case_exclusions.iter().cloned(),
        );
        let dedup = DeduplicationCache::new(
            Duration::from_millis(options.dedup_window_ms),
            options.dedup_max_entries,
            options.dedup_events.iter().cloned(),
        );
        let heartbeat = HeartbeatMonitor::new(timeouts.heartbeat_interval, timeouts.pong_timeout);
        let registry =
            SubscriptionRegistry::new(timeouts.subscribe_timeout, timeouts.unsubscribe_timeout);

        Self {
            ws_url,
            transport,
            credentials,
            options,
            timeouts,
            router,
            normalizer,
            dedup,
            heartbeat,
            registry,
            snapshot: ConnectionSnapshot::default(),
            state_tx,
            socket: None,
            retry_at: None,
        }
    }

    async fn run(mut self, mut cmd_rx: CmdRx) {
        log::debug!("[triage-link] Connection task started for {}", self.ws_url);

        loop {
            let flow = match self.snapshot.state {
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.drive_idle(&mut cmd_rx).await
                },
                ConnectionState::Connected => self.drive_connected(&mut cmd_rx).await,
                ConnectionState::Reconnecting if self.retry_at.is_some() => {
                    self.drive_backoff(&mut cmd_rx).await
                },
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.drive_attempt(&mut cmd_rx).await
                },
            };
            if flow.is_break() {
                break;
            }
        }

        self.teardown().await;
        log::debug!("[triage-link] Connection task stopped");
    }

    // ── Per-state drivers ───────────────────────────────────────────────

    async fn drive_idle(&mut self, cmd_rx: &mut CmdRx) -> ControlFlow<()> {
        match cmd_rx.recv().await {
            None => ControlFlow::Break(()),
            Some(ConnCmd::Connect) => {
                self.begin_connect();
                ControlFlow::Continue(())
            },
            Some(cmd) => self.handle_offline(cmd),
        }
    }

    async fn drive_backoff(&mut self, cmd_rx: &mut CmdRx) -> ControlFlow<()> {
        let retry_at = self.retry_at.unwrap_or_else(TokioInstant::now);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                None => ControlFlow::Break(()),
                Some(cmd) => self.handle_offline(cmd),
            },

            _ = tokio::time::sleep_until(retry_at) => {
                self.retry_at = None;
                ControlFlow::Continue(())
            },
        }
    }

    async fn drive_attempt(&mut self, cmd_rx: &mut CmdRx) -> ControlFlow<()> {
        let token = match usable_token(self.credentials.as_ref()) {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[triage-link] Abandoning connection attempt: {}", e);
                self.emit_failure(&e);
                self.go_disconnected();
                return ControlFlow::Continue(());
            },
        };

        log::debug!(
            "[triage-link] Opening connection to {} (attempt {})",
            self.ws_url,
            self.snapshot.reconnect_attempt + 1
        );
        let attempt = establish(
            self.transport.clone(),
            self.ws_url.clone(),
            token,
            self.timeouts.clone(),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return ControlFlow::Break(());
                    };
                    let flow = self.handle_offline(cmd);
                    // A disconnect abandons the attempt; dropping the future
                    // closes whatever socket it had opened.
                    if flow.is_break() || !self.snapshot.state.is_active() {
                        return flow;
                    }
                },

                result = &mut attempt => {
                    match result {
                        Ok((socket, socket_id)) => self.on_established(socket, socket_id).await,
                        Err(e) => self.on_attempt_failed(e),
                    }
                    return ControlFlow::Continue(());
                },
            }
        }
    }

    async fn drive_connected(&mut self, cmd_rx: &mut CmdRx) -> ControlFlow<()> {
        let Some(socket) = self.socket.as_mut() else {
            self.on_connection_lost(DisconnectReason::new("Socket missing"), false);
            return ControlFlow::Continue(());
        };

        let far = TokioInstant::now() + FAR_FUTURE;
        let heartbeat_at = self.heartbeat.next_deadline();
        let ack_deadline = self.registry.next_deadline();

        tokio::select! {
            biased;

            _ = tokio::time::sleep_until(heartbeat_at.unwrap_or(far)), if heartbeat_at.is_some() => {
                self.on_heartbeat_due().await;
                ControlFlow::Continue(())
            },

            cmd = cmd_rx.recv() => match cmd {
                None => ControlFlow::Break(()),
                Some(cmd) => self.handle_connected(cmd).await,
            },

            frame = socket.recv() => {
                match frame {
                    Ok(Incoming::Text(text)) => self.handle_frame(&text).await,
                    Ok(Incoming::Closed(reason)) => {
                        let auth = is_auth_disconnect(&reason.message);
                        self.on_connection_lost(reason, auth);
                    },
                    Err(e) => {
                        self.emit_failure(&e);
                        self.on_connection_lost(DisconnectReason::new(e.to_string()), false);
                    },
                }
                ControlFlow::Continue(())
            },

            _ = tokio::time::sleep_until(ack_deadline.unwrap_or(far)), if ack_deadline.is_some() => {
                self.expire_subscriptions();
                ControlFlow::Continue(())
            },
        }
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Commands received while no socket is open.
    fn handle_offline(&mut self, cmd: ConnCmd) -> ControlFlow<()> {
        let now = TokioInstant::now();
        match cmd {
            ConnCmd::Connect => {
                log::debug!("[triage-link] connect() ignored while {}", self.snapshot.state);
            },
            ConnCmd::Disconnect => {
                if self.snapshot.state != ConnectionState::Disconnected {
                    log::info!(
                        "[triage-link] Disconnect requested while {}",
                        self.snapshot.state
                    );
                    self.go_disconnected();
                }
            },
            ConnCmd::Emit { event, result_tx, .. } => {
                log::debug!("[triage-link] Dropping emit of '{}': not connected", event);
                let _ = result_tx.send(Err(TriageLinkError::NotConnected));
            },
            ConnCmd::Subscribe {
                entity_id,
                result_tx,
            } => {
                if self.snapshot.state.is_active() {
                    log::debug!("[triage-link] Queueing subscribe for '{}'", entity_id);
                    self.registry.subscribe(&entity_id, result_tx, now, false);
                } else {
                    let _ = result_tx.send(Err(TriageLinkError::NotConnected));
                }
            },
            ConnCmd::Unsubscribe {
                entity_id,
                result_tx,
            } => {
                self.registry.unsubscribe(&entity_id, result_tx, now, false);
            },
            ConnCmd::SubscriptionInfo {
                entity_id,
                result_tx,
            } => {
                let _ = result_tx.send(self.registry.info(&entity_id));
            },
            ConnCmd::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn handle_connected(&mut self, cmd: ConnCmd) -> ControlFlow<()> {
        let now = TokioInstant::now();
        match cmd {
            ConnCmd::Connect => {
                log::debug!("[triage-link] connect() ignored: already connected");
            },
            ConnCmd::Disconnect => {
                log::info!("[triage-link] Disconnecting on request");
                self.close_gracefully().await;
                self.router.emit(
                    event_names::DISCONNECT,
                    &reason_payload(&DisconnectReason::new("Client disconnected")),
                );
                self.go_disconnected();
            },
            ConnCmd::Emit {
                event,
                payload,
                result_tx,
            } => {
                let result = self.send_event(&event, payload).await;
                let lost = matches!(result, Err(TriageLinkError::WebSocketError(_)));
                let _ = result_tx.send(result);
                if lost {
                    self.on_connection_lost(DisconnectReason::new("Send failed"), false);
                }
            },
            ConnCmd::Subscribe {
                entity_id,
                result_tx,
            } => {
                if self.registry.subscribe(&entity_id, result_tx, now, true) {
                    log::debug!("[triage-link] Subscribing to '{}'", entity_id);
                    self.send_or_reconnect(event_names::SUBSCRIBE, &entity_id).await;
                }
            },
            ConnCmd::Unsubscribe {
                entity_id,
                result_tx,
            } => {
                if self.registry.unsubscribe(&entity_id, result_tx, now, true) {
                    log::debug!("[triage-link] Unsubscribing from '{}'", entity_id);
                    self.send_or_reconnect(event_names::UNSUBSCRIBE, &entity_id).await;
                }
            },
            ConnCmd::SubscriptionInfo {
                entity_id,
                result_tx,
            } => {
                let _ = result_tx.send(self.registry.info(&entity_id));
            },
            ConnCmd::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // ── Inbound frames ──────────────────────────────────────────────────

    async fn handle_frame(&mut self, text: &str) {
        let envelope = match parse_frame(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[triage-link] Dropping frame: {}", e);
                return;
            },
        };
        let event = envelope.event;
        let payload = self.normalizer.inbound(envelope.data);
        log::trace!("[triage-link] <- {}", event);

        match event.as_str() {
            event_names::PING => {
                if let Err(e) = self.send_event(event_names::PONG, payload.clone()).await {
                    log::warn!("[triage-link] Failed to answer server ping: {}", e);
                }
            },
            event_names::PONG => {
                if self.heartbeat.on_pong(&payload, TokioInstant::now()) {
                    self.snapshot.last_heartbeat_ack_at = self.heartbeat.last_ack_at();
                    self.publish();
                }
            },
            event_names::SUBSCRIBE_ACK => match entity_id_of(&payload) {
                Some(entity_id) => match payload.get("error").and_then(JsonValue::as_str) {
                    Some(message) => {
                        log::warn!(
                            "[triage-link] Subscription to '{}' rejected: {}",
                            entity_id,
                            message
                        );
                        self.registry.on_subscribe_rejected(entity_id, message);
                        self.router.emit(
                            event_names::SUBSCRIPTION_ERROR,
                            &json!({
                                "entityId": entity_id,
                                "operation": "subscribe",
                                "message": message,
                            }),
                        );
                    },
                    None => {
                        let watchers = watchers_of(&payload).unwrap_or_default();
                        self.registry.on_subscribe_ack(entity_id, watchers);
                    },
                },
                None => log::warn!("[triage-link] subscribe_ack without entity id"),
            },
            event_names::UNSUBSCRIBE_ACK => match entity_id_of(&payload) {
                Some(entity_id) => {
                    self.registry.on_unsubscribe_ack(entity_id);
                },
                None => log::warn!("[triage-link] unsubscribe_ack without entity id"),
            },
            event_names::ENTITY_WATCHERS_CHANGED => {
                if let (Some(entity_id), Some(watchers)) =
                    (entity_id_of(&payload), watchers_of(&payload))
                {
                    self.registry.on_watchers_changed(entity_id, watchers);
                }
            },
            event_names::CONNECT => {
                if let Some(sid) = socket_id_of(&payload) {
                    self.snapshot.socket_id = Some(sid);
                    self.publish();
                }
            },
            event_names::CONNECT_ERROR => {
                let message = payload
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("connect_error")
                    .to_string();
                self.router.emit(event_names::CONNECT_ERROR, &payload);
                self.on_connection_lost(DisconnectReason::new(message), true);
                return;
            },
            event_names::DISCONNECT => {
                let message = payload
                    .get("reason")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("server disconnect")
                    .to_string();
                let auth = is_auth_disconnect(&message);
                self.on_connection_lost(DisconnectReason::new(message), auth);
                return;
            },
            _ => {},
        }

        if self.dedup.should_suppress(&event, &payload) {
            log::trace!("[triage-link] Suppressed duplicate '{}'", event);
            return;
        }
        self.router.emit(&event, &payload);
    }

    // ── Timers ──────────────────────────────────────────────────────────

    async fn on_heartbeat_due(&mut self) {
        match self.heartbeat.poll(TokioInstant::now()) {
            HeartbeatAction::Idle => {},
            HeartbeatAction::SendPing(payload) => {
                self.snapshot.last_heartbeat_sent_at = self.heartbeat.last_sent_at();
                self.publish();
                if let Err(e) = self.send_event(event_names::PING, payload).await {
                    self.on_connection_lost(
                        DisconnectReason::new(format!("Failed to send heartbeat: {}", e)),
                        false,
                    );
                }
            },
            HeartbeatAction::Expired => {
                self.emit_error("Heartbeat timeout: server unresponsive", true);
                self.on_connection_lost(DisconnectReason::new("heartbeat timeout"), false);
            },
        }
    }

    fn expire_subscriptions(&mut self) {
        for expired in self.registry.expire(TokioInstant::now()) {
            log::warn!(
                "[triage-link] {} of '{}' was not acknowledged in time",
                expired.operation,
                expired.entity_id
            );
            self.router.emit(
                event_names::SUBSCRIPTION_ERROR,
                &json!({
                    "entityId": expired.entity_id,
                    "operation": expired.operation,
                    "message": "Acknowledgement timed out",
                }),
            );
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    fn begin_connect(&mut self) {
        if let Err(e) = usable_token(self.credentials.as_ref()) {
            log::warn!("[triage-link] connect() ignored: {}", e);
            self.emit_failure(&e);
            return;
        }
        self.snapshot.reconnect_attempt = 0;
        self.retry_at = None;
        self.set_state(ConnectionState::Connecting);
    }

    async fn on_established(&mut self, socket: Box<dyn WireSocket>, socket_id: Option<String>) {
        let now = TokioInstant::now();
        log::info!(
            "[triage-link] Connected to {} (socket id: {})",
            self.ws_url,
            socket_id.as_deref().unwrap_or("-")
        );

        self.socket = Some(socket);
        self.snapshot.socket_id = socket_id.clone();
        self.snapshot.reconnect_attempt = 0;
        self.retry_at = None;
        self.dedup.clear();
        self.heartbeat.start(now);
        self.set_state(ConnectionState::Connected);
        self.router.emit(event_names::CONNECT, &json!({ "socketId": socket_id }));

        let ids = self.registry.reissue(now);
        if !ids.is_empty() {
            log::info!("[triage-link] Re-subscribing {} entity subscription(s)", ids.len());
        }
        for entity_id in ids {
            if self.socket.is_none() {
                break;
            }
            self.send_or_reconnect(event_names::SUBSCRIBE, &entity_id).await;
        }
    }

    fn on_attempt_failed(&mut self, err: TriageLinkError) {
        self.emit_failure(&err);
        if err.is_recoverable() {
            log::warn!("[triage-link] Connection attempt failed: {}", err);
            self.schedule_retry();
        } else {
            if err.is_auth_error() {
                log::warn!("[triage-link] Credential rejected: {}", err);
            } else {
                log::error!("[triage-link] Connection attempt cannot succeed: {}", err);
            }
            self.go_disconnected();
        }
    }

    /// Drop the live socket after a failure. `auth` means the server will
    /// not take this credential again, so no retry is scheduled.
    fn on_connection_lost(&mut self, reason: DisconnectReason, auth: bool) {
        log::warn!("[triage-link] Connection lost: {}", reason);
        self.heartbeat.stop();
        self.registry.demote_all();
        if let Some(mut socket) = self.socket.take() {
            tokio::spawn(async move { socket.close().await });
        }
        self.router.emit(event_names::DISCONNECT, &reason_payload(&reason));

        if auth {
            self.emit_error(&format!("Session ended by server: {}", reason.message), false);
            self.go_disconnected();
        } else {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        if !self.options.auto_reconnect {
            log::info!("[triage-link] Auto-reconnect disabled");
            self.go_disconnected();
            return;
        }

        let attempt = self.snapshot.reconnect_attempt;
        if let Some(max) = self.options.max_reconnect_attempts {
            if attempt >= max {
                let message = format!("Max reconnection attempts ({}) reached", max);
                log::warn!("[triage-link] {}", message);
                self.retry_at = None;
                self.registry.fail_waiters(&TriageLinkError::NotConnected);
                self.set_state(ConnectionState::Failed);
                self.emit_error(&message, false);
                return;
            }
        }

        let delay = jittered_backoff(&self.options, attempt);
        self.snapshot.reconnect_attempt = attempt + 1;
        self.retry_at = Some(TokioInstant::now() + delay);
        log::info!(
            "[triage-link] Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            attempt + 1
        );
        if !self.set_state(ConnectionState::Reconnecting) {
            self.publish();
        }
        self.router.emit(
            event_names::RECONNECT_ATTEMPT,
            &json!({
                "attempt": attempt + 1,
                "delayMs": delay.as_millis() as u64,
            }),
        );
    }

    fn go_disconnected(&mut self) {
        self.heartbeat.stop();
        self.registry.demote_all();
        self.registry.fail_waiters(&TriageLinkError::NotConnected);
        self.socket = None;
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Returns `true` when the state actually changed.
    fn set_state(&mut self, state: ConnectionState) -> bool {
        let previous = self.snapshot.state;
        if previous == state {
            return false;
        }

        self.snapshot.state = state;
        if state != ConnectionState::Connected {
            self.snapshot.socket_id = None;
        }
        log::info!("[triage-link] Connection state: {} -> {}", previous, state);
        self.publish();
        self.router.emit(
            event_names::CONNECTION_STATE_CHANGED,
            &json!({
                "state": state.as_str(),
                "previousState": previous.as_str(),
            }),
        );
        true
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot.clone());
    }

    fn emit_failure(&self, err: &TriageLinkError) {
        self.emit_error(&err.to_string(), err.is_recoverable());
    }

    fn emit_error(&self, message: &str, recoverable: bool) {
        let error = ConnectionError::new(message, recoverable);
        let payload = serde_json::to_value(&error).unwrap_or(JsonValue::Null);
        self.router.emit(event_names::CONNECTION_ERROR, &payload);
    }

    // ── Outbound ────────────────────────────────────────────────────────

    async fn send_event(&mut self, event: &str, payload: JsonValue) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(TriageLinkError::NotConnected)?;
        let text = encode_frame(event, self.normalizer.outbound(payload))?;
        log::trace!("[triage-link] -> {}", event);
        socket.send(text).await
    }

    /// Send a subscription-protocol request; a failed send means the socket
    /// is gone.
    async fn send_or_reconnect(&mut self, event: &str, entity_id: &str) {
        if let Err(e) = self.send_event(event, json!({ "entityId": entity_id })).await {
            let reason = format!("Failed to send {} for '{}': {}", event, entity_id, e);
            self.on_connection_lost(DisconnectReason::new(reason), false);
        }
    }

    /// Release server-side subscriptions and close the socket.
    async fn close_gracefully(&mut self) {
        for entity_id in self.registry.active_ids() {
            let payload = json!({ "entityId": entity_id });
            let _ = self.send_event(event_names::UNSUBSCRIBE, payload).await;
        }
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    async fn teardown(&mut self) {
        if self.socket.is_some() {
            self.close_gracefully().await;
            self.router.emit(
                event_names::DISCONNECT,
                &reason_payload(&DisconnectReason::new("Client shut down")),
            );
        }
        self.heartbeat.stop();
        self.registry.clear(&TriageLinkError::Cancelled);
        self.retry_at = None;
        self.set_state(ConnectionState::Disconnected);
        self.router.clear();
    }
}

fn reason_payload(reason: &DisconnectReason) -> JsonValue {
    serde_json::to_value(reason).unwrap_or(JsonValue::Null)
}

fn socket_id_of(payload: &JsonValue) -> Option<String> {
    ["sid", "socketId", "socket_id"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(JsonValue::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Open a socket and wait for the server's handshake.
async fn establish(
    transport: Arc<dyn Transport>,
    url: String,
    token: String,
    timeouts: TriageLinkTimeouts,
) -> Result<(Box<dyn WireSocket>, Option<String>)> {
    let opened = if TriageLinkTimeouts::is_no_timeout(timeouts.connection_timeout) {
        transport.open(&url, &token).await
    } else {
        tokio::time::timeout(timeouts.connection_timeout, transport.open(&url, &token))
            .await
            .map_err(|_| {
                TriageLinkError::TimeoutError(format!(
                    "Connection timeout ({:?})",
                    timeouts.connection_timeout
                ))
            })?
    };
    let mut socket = opened?;

    match await_handshake(&mut *socket, timeouts.handshake_timeout).await {
        Ok(socket_id) => Ok((socket, socket_id)),
        Err(e) => {
            socket.close().await;
            Err(e)
        },
    }
}

/// Wait for `connect` (success) or `connect_error` (credential refused).
/// Frames that arrive before either are skipped.
async fn await_handshake(
    socket: &mut dyn WireSocket,
    timeout: Duration,
) -> Result<Option<String>> {
    let deadline = if TriageLinkTimeouts::is_no_timeout(timeout) {
        TokioInstant::now() + FAR_FUTURE
    } else {
        TokioInstant::now() + timeout
    };

    loop {
        let incoming = tokio::time::timeout_at(deadline, socket.recv())
            .await
            .map_err(|_| {
                TriageLinkError::TimeoutError(format!("Handshake timeout ({:?})", timeout))
            })??;

        match incoming {
            Incoming::Text(text) => {
                let envelope = match parse_frame(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::debug!("[triage-link] Ignoring frame during handshake: {}", e);
                        continue;
                    },
                };
                match envelope.event.as_str() {
                    event_names::CONNECT => return Ok(socket_id_of(&envelope.data)),
                    event_names::CONNECT_ERROR => {
                        let message = envelope
                            .data
                            .get("message")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("Connection refused by server");
                        return Err(TriageLinkError::AuthenticationError(message.to_string()));
                    },
                    other => {
                        log::debug!("[triage-link] Ignoring '{}' during handshake", other);
                    },
                }
            },
            Incoming::Closed(reason) if is_auth_disconnect(&reason.message) => {
                return Err(TriageLinkError::AuthenticationError(format!(
                    "Server refused the session: {}",
                    reason
                )));
            },
            Incoming::Closed(reason) => {
                return Err(TriageLinkError::WebSocketError(format!(
                    "Connection closed during handshake: {}",
                    reason
                )));
            },
        }
    }
}
