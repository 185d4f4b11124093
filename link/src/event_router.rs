//! Named-event publish/subscribe registry.
//!
//! Every normalized server event and every local lifecycle event
//! (`connection_state_changed`, `connection_error`, ...) is published here.
//!
//! - Listeners for one event run in registration order.
//! - A panicking listener is caught and logged; the remaining listeners
//!   still run and the emitter never sees the panic.
//! - Registering the same `(event, listener)` pair again is a no-op that
//!   hands out another [`ListenerHandle`] for the same registration, so
//!   components that re-register on every mount stay safe.
//!
//! # Example
//!
//! ```rust
//! use triage_link::{EventRouter, Listener};
//! use std::sync::Arc;
//!
//! let router = EventRouter::new();
//! let listener: Listener = Arc::new(|payload: &serde_json::Value| println!("updated: {}", payload));
//! let handle = router.on("entity_updated", listener);
//!
//! router.emit("entity_updated", &serde_json::json!({"entityId": "VULN-1"}));
//! drop(handle); // unregisters
//! assert_eq!(router.listener_count("entity_updated"), 0);
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked with the (internal-case) event payload.
pub type Listener = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Reason for a disconnect event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectReason {
    /// Human-readable description of why the connection closed.
    pub message: String,
    /// WebSocket close code, if available (e.g. 1000 = normal, 1006 = abnormal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Payload of the local `connection_error` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionError {
    pub message: String,
    /// Whether auto-reconnect may still succeed
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

struct Registration {
    id: u64,
    listener: Listener,
    holders: usize,
}

#[derive(Default)]
struct RouterInner {
    listeners: Mutex<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl RouterInner {
    fn release(&self, event: &str, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(regs) = listeners.get_mut(event) {
            if let Some(pos) = regs.iter().position(|r| r.id == id) {
                regs[pos].holders = regs[pos].holders.saturating_sub(1);
                if regs[pos].holders == 0 {
                    regs.remove(pos);
                }
            }
            if regs.is_empty() {
                listeners.remove(event);
            }
        }
    }
}

/// Typed publish/subscribe registry shared by the client handle and the
/// connection task. Cloning is cheap and clones share registrations.
#[derive(Clone, Default)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.inner.listeners.lock();
        let counts: HashMap<&str, usize> =
            listeners.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("EventRouter").field("listeners", &counts).finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`.
    ///
    /// The registration lives while at least one returned handle is alive
    /// (or until [`off`](Self::off) / [`clear`](Self::clear)). Use
    /// [`ListenerHandle::detach`] to keep it for the router's lifetime.
    #[must_use = "dropping the handle unregisters the listener"]
    pub fn on(&self, event: &str, listener: Listener) -> ListenerHandle {
        let mut listeners = self.inner.listeners.lock();
        let regs = listeners.entry(event.to_string()).or_default();

        let id = match regs.iter_mut().find(|r| Arc::ptr_eq(&r.listener, &listener)) {
            Some(existing) => {
                existing.holders += 1;
                log::trace!("[triage-link] Listener for '{}' already registered", event);
                existing.id
            },
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                regs.push(Registration {
                    id,
                    listener,
                    holders: 1,
                });
                id
            },
        };

        ListenerHandle {
            router: Arc::downgrade(&self.inner),
            event: event.to_string(),
            id,
            active: true,
        }
    }

    /// Remove `listener` from `event` regardless of outstanding handles.
    /// Returns `true` if it was registered.
    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(regs) = listeners.get_mut(event) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| !Arc::ptr_eq(&r.listener, listener));
        let removed = regs.len() != before;
        if regs.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invoke every listener of `event` in registration order.
    ///
    /// Returns how many listeners completed without panicking. Listeners may
    /// register or remove listeners re-entrantly; changes apply from the
    /// next emit.
    pub fn emit(&self, event: &str, payload: &JsonValue) -> usize {
        let snapshot: Vec<Listener> = {
            let listeners = self.inner.listeners.lock();
            match listeners.get(event) {
                Some(regs) => regs.iter().map(|r| r.listener.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    log::error!(
                        "[triage-link] Listener for '{}' panicked: {}",
                        event,
                        panic_message(&panic)
                    );
                },
            }
        }
        delivered
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Drop every registration (full teardown).
    pub fn clear(&self) {
        self.inner.listeners.lock().clear();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

/// Ownership token for one listener registration.
///
/// Dropping it releases the registration (when it is the last holder).
pub struct ListenerHandle {
    router: Weak<RouterInner>,
    event: String,
    id: u64,
    active: bool,
}

impl ListenerHandle {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Release now. Equivalent to dropping the handle.
    pub fn remove(self) {}

    /// Keep the registration until `off`/`clear`, giving up this handle.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(inner) = self.router.upgrade() {
            inner.release(&self.event, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        Arc::new(move |_payload: &JsonValue| log.lock().push(tag.to_string()))
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = router.on("entity_created", recorder(log.clone(), "a"));
        let _b = router.on("entity_created", recorder(log.clone(), "b"));
        let _c = router.on("entity_created", recorder(log.clone(), "c"));

        assert_eq!(router.emit("entity_created", &json!({})), 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = router.on("entity_updated", recorder(log.clone(), "a"));
        let _boom = router.on("entity_updated", Arc::new(|_: &JsonValue| panic!("render failed")));
        let _c = router.on("entity_updated", recorder(log.clone(), "c"));

        assert_eq!(router.emit("entity_updated", &json!({"entityId": "X-1"})), 2);
        assert_eq!(*log.lock(), vec!["a", "c"]);
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener: Listener = Arc::new(move |_: &JsonValue| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = router.on("comment_added", listener.clone());
        let second = router.on("comment_added", listener.clone());
        assert_eq!(router.listener_count("comment_added"), 1);

        router.emit("comment_added", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(router.listener_count("comment_added"), 1);
        drop(second);
        assert_eq!(router.listener_count("comment_added"), 0);
    }

    #[test]
    fn test_off_removes_regardless_of_handles() {
        let router = EventRouter::new();
        let listener: Listener = Arc::new(|_: &JsonValue| {});
        let handle = router.on("job_progress", listener.clone());

        assert!(router.off("job_progress", &listener));
        assert!(!router.off("job_progress", &listener));
        assert_eq!(router.listener_count("job_progress"), 0);
        drop(handle);
    }

    #[test]
    fn test_detach_keeps_registration() {
        let router = EventRouter::new();
        router.on("pong", Arc::new(|_: &JsonValue| {})).detach();
        assert_eq!(router.listener_count("pong"), 1);
        router.clear();
        assert_eq!(router.listener_count("pong"), 0);
    }

    #[test]
    fn test_reentrant_registration_applies_next_emit() {
        let router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let router_clone = router.clone();
        let hits_clone = hits.clone();
        let _outer = router.on(
            "entity_created",
            Arc::new(move |_: &JsonValue| {
                let hits = hits_clone.clone();
                router_clone
                    .on(
                        "entity_created",
                        Arc::new(move |_: &JsonValue| {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .detach();
            }),
        );

        router.emit("entity_created", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        router.emit("entity_created", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_without_listeners() {
        let router = EventRouter::new();
        assert_eq!(router.emit("nothing", &json!(null)), 0);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::with_code("bye", 1000).to_string(), "bye (code: 1000)");
        assert_eq!(DisconnectReason::new("gone").to_string(), "gone");
    }
}
