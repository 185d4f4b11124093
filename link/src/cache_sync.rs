//! Applies routed server events to an external cache store.
//!
//! Each event name maps to a [`SyncRule`]. When a rule can merge and the
//! cache already holds the target entry, the entry is replaced in place and
//! nothing is invalidated. Otherwise every key the rule names is marked
//! stale so the next read refetches. The bridge never creates entries.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use triage_link::{CacheKey, CacheStore, CacheSyncBridge, SyncRule};
//! # fn store() -> Arc<dyn CacheStore> { unimplemented!() }
//!
//! let bridge = CacheSyncBridge::new(store())
//!     .with_default_rules()
//!     .with_rule("asset_tagged", SyncRule::new().invalidate(CacheKey::new(["assets"])));
//! ```

mod defaults;

pub use defaults::{comments_key, default_rules, entity_key, job_key, shallow_merge, ENTITY_LIST};

use crate::{
    error::Result,
    event_router::{EventRouter, ListenerHandle},
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::Duration,
};

/// Composite cache address, e.g. `["entity", "VULN-1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

/// Key-addressable store owned by the embedding application.
///
/// The bridge only ever reads one entry, replaces one entry, or marks
/// entries stale; it never iterates or clears the store. `mark_stale` on a
/// missing key must not create it.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<JsonValue>;
    fn set(&self, key: &CacheKey, value: JsonValue);
    fn mark_stale(&self, key: &CacheKey);
}

/// Derives the detail key an event targets.
pub type DetailKeyFn = Arc<dyn Fn(&JsonValue) -> Option<CacheKey> + Send + Sync>;

/// `(cached, payload) -> replacement`. An error falls back to invalidation.
pub type MergeFn = Arc<dyn Fn(&JsonValue, &JsonValue) -> Result<JsonValue> + Send + Sync>;

/// What to do with the cache when one event arrives.
#[derive(Clone, Default)]
pub struct SyncRule {
    invalidation_keys: Vec<CacheKey>,
    detail_key: Option<DetailKeyFn>,
    merge: Option<MergeFn>,
    coalesce: Option<Duration>,
}

impl SyncRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key marked stale on the invalidation path.
    pub fn invalidate(mut self, key: CacheKey) -> Self {
        if !self.invalidation_keys.contains(&key) {
            self.invalidation_keys.push(key);
        }
        self
    }

    pub fn with_detail_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<CacheKey> + Send + Sync + 'static,
    {
        self.detail_key = Some(Arc::new(f));
        self
    }

    pub fn with_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue, &JsonValue) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(f));
        self
    }

    /// Apply bursts within `window` once, using the last payload.
    ///
    /// Only use for events whose latest payload supersedes earlier ones
    /// (progress ticks, reaction totals).
    pub fn with_coalesce(mut self, window: Duration) -> Self {
        self.coalesce = Some(window);
        self
    }

    pub fn invalidation_keys(&self) -> &[CacheKey] {
        &self.invalidation_keys
    }

    pub fn coalesce_window(&self) -> Option<Duration> {
        self.coalesce.filter(|w| !w.is_zero())
    }
}

impl fmt::Debug for SyncRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRule")
            .field("invalidation_keys", &self.invalidation_keys)
            .field("detail_key", &self.detail_key.is_some())
            .field("merge", &self.merge.is_some())
            .field("coalesce", &self.coalesce)
            .finish()
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No rule for this event
    Ignored,
    /// The cached entry was replaced by the merge result
    Merged(CacheKey),
    /// These keys were marked stale
    Invalidated(Vec<CacheKey>),
}

type BurstSlot = (String, Option<CacheKey>);

/// Event-to-cache mapping table driven by the [`EventRouter`].
pub struct CacheSyncBridge {
    store: Arc<dyn CacheStore>,
    rules: HashMap<String, SyncRule>,
    bursts: Mutex<HashMap<BurstSlot, JsonValue>>,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl CacheSyncBridge {
    /// Bridge with an empty mapping table.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            rules: HashMap::new(),
            bursts: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Add the tracker's built-in mappings. Rules added later override.
    pub fn with_default_rules(mut self) -> Self {
        self.rules.extend(default_rules());
        self
    }

    pub fn with_rule(mut self, event: impl Into<String>, rule: SyncRule) -> Self {
        self.rules.insert(event.into(), rule);
        self
    }

    pub fn rule(&self, event: &str) -> Option<&SyncRule> {
        self.rules.get(event)
    }

    /// Register one router listener per mapped event.
    ///
    /// Listeners hold only a weak reference, so dropping the last `Arc` of
    /// the bridge stops it.
    pub fn attach(self: &Arc<Self>, router: &EventRouter) {
        let mut listeners = self.listeners.lock();
        for event in self.rules.keys() {
            let bridge = Arc::downgrade(self);
            let name = event.clone();
            let handle = router.on(
                event,
                Arc::new(move |payload: &JsonValue| {
                    if let Some(bridge) = bridge.upgrade() {
                        bridge.handle(&name, payload);
                    }
                }),
            );
            listeners.push(handle);
        }
        log::debug!("[triage-link] Cache bridge attached to {} event(s)", listeners.len());
    }

    /// Remove every listener registered by [`attach`](Self::attach).
    pub fn detach(&self) {
        self.listeners.lock().clear();
        self.bursts.lock().clear();
    }

    /// Route one event through its rule, coalescing when configured.
    ///
    /// Coalescing needs a tokio runtime; without one the event is applied
    /// immediately.
    pub fn handle(self: &Arc<Self>, event: &str, payload: &JsonValue) {
        let Some(rule) = self.rules.get(event) else {
            return;
        };

        if let Some(window) = rule.coalesce_window() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let slot: BurstSlot = (event.to_string(), derive_detail_key(rule, payload));
                let first = self
                    .bursts
                    .lock()
                    .insert(slot.clone(), payload.clone())
                    .is_none();
                if first {
                    runtime.spawn(flush_burst(Arc::downgrade(self), slot, window));
                }
                return;
            }
        }

        self.apply(event, payload);
    }

    /// Apply one event right now, bypassing coalescing.
    pub fn apply(&self, event: &str, payload: &JsonValue) -> SyncOutcome {
        let Some(rule) = self.rules.get(event) else {
            return SyncOutcome::Ignored;
        };

        let detail_key = derive_detail_key(rule, payload);

        if let (Some(merge), Some(key)) = (&rule.merge, &detail_key) {
            if let Some(existing) = self.store.get(key) {
                match catch_unwind(AssertUnwindSafe(|| merge(&existing, payload))) {
                    Ok(Ok(merged)) => {
                        log::trace!("[triage-link] Merged '{}' into {}", event, key);
                        self.store.set(key, merged);
                        return SyncOutcome::Merged(key.clone());
                    },
                    Ok(Err(e)) => {
                        log::warn!(
                            "[triage-link] Merge for '{}' into {} failed, invalidating: {}",
                            event,
                            key,
                            e
                        );
                    },
                    Err(_) => {
                        log::error!(
                            "[triage-link] Merge for '{}' into {} panicked, invalidating",
                            event,
                            key
                        );
                    },
                }
            }
        }

        let mut stale = rule.invalidation_keys.clone();
        if let Some(key) = detail_key {
            if !stale.contains(&key) {
                stale.push(key);
            }
        }
        for key in &stale {
            self.store.mark_stale(key);
        }
        log::trace!("[triage-link] '{}' invalidated {} key(s)", event, stale.len());
        SyncOutcome::Invalidated(stale)
    }
}

impl fmt::Debug for CacheSyncBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSyncBridge")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

fn derive_detail_key(rule: &SyncRule, payload: &JsonValue) -> Option<CacheKey> {
    let f = rule.detail_key.as_ref()?;
    match catch_unwind(AssertUnwindSafe(|| f(payload))) {
        Ok(key) => key,
        Err(_) => {
            log::error!("[triage-link] Detail key function panicked");
            None
        },
    }
}

async fn flush_burst(bridge: Weak<CacheSyncBridge>, slot: BurstSlot, window: Duration) {
    tokio::time::sleep(window).await;
    let Some(bridge) = bridge.upgrade() else {
        return;
    };
    let last = bridge.bursts.lock().remove(&slot);
    if let Some(payload) = last {
        bridge.apply(&slot.0, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TriageLinkError;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingStore {
        entries: Mutex<HashMap<CacheKey, JsonValue>>,
        stale: Mutex<BTreeSet<CacheKey>>,
        sets: Mutex<Vec<CacheKey>>,
    }

    impl CacheStore for RecordingStore {
        fn get(&self, key: &CacheKey) -> Option<JsonValue> {
            self.entries.lock().get(key).cloned()
        }

        fn set(&self, key: &CacheKey, value: JsonValue) {
            self.sets.lock().push(key.clone());
            self.entries.lock().insert(key.clone(), value);
        }

        fn mark_stale(&self, key: &CacheKey) {
            self.stale.lock().insert(key.clone());
        }
    }

    fn detail(id: &str) -> CacheKey {
        CacheKey::new(["entity", id])
    }

    fn update_rule() -> SyncRule {
        SyncRule::new()
            .invalidate(CacheKey::new(["entities"]))
            .with_detail_key(|p: &JsonValue| {
                p.get("entityId").and_then(JsonValue::as_str).map(detail)
            })
            .with_merge(|cached: &JsonValue, p: &JsonValue| shallow_merge(cached, &p["changes"]))
    }

    fn bridge(store: Arc<RecordingStore>) -> CacheSyncBridge {
        CacheSyncBridge::new(store).with_rule("entity_updated", update_rule())
    }

    #[test]
    fn test_merge_replaces_existing_entry_without_invalidation() {
        let store = Arc::new(RecordingStore::default());
        store
            .entries
            .lock()
            .insert(detail("X-1"), json!({"id": "X-1", "severity": "low", "title": "t"}));
        let bridge = bridge(store.clone());

        let outcome = bridge.apply(
            "entity_updated",
            &json!({"entityId": "X-1", "changes": {"severity": "high"}}),
        );

        assert_eq!(outcome, SyncOutcome::Merged(detail("X-1")));
        assert_eq!(
            store.get(&detail("X-1")),
            Some(json!({"id": "X-1", "severity": "high", "title": "t"}))
        );
        assert!(store.stale.lock().is_empty());
    }

    #[test]
    fn test_missing_entry_is_marked_stale_not_created() {
        let store = Arc::new(RecordingStore::default());
        let bridge = bridge(store.clone());

        let outcome = bridge.apply(
            "entity_updated",
            &json!({"entityId": "X-1", "changes": {"severity": "high"}}),
        );

        assert_eq!(
            outcome,
            SyncOutcome::Invalidated(vec![CacheKey::new(["entities"]), detail("X-1")])
        );
        assert!(store.get(&detail("X-1")).is_none());
        assert!(store.sets.lock().is_empty());
        assert!(store.stale.lock().contains(&detail("X-1")));
    }

    #[test]
    fn test_failing_merge_falls_back_to_invalidation() {
        let store = Arc::new(RecordingStore::default());
        store.entries.lock().insert(detail("X-1"), json!({"id": "X-1"}));
        let bridge = CacheSyncBridge::new(store.clone()).with_rule(
            "entity_updated",
            update_rule().with_merge(|_: &JsonValue, _: &JsonValue| {
                Err(TriageLinkError::ProtocolError("bad shape".into()))
            }),
        );

        let outcome = bridge.apply("entity_updated", &json!({"entityId": "X-1"}));
        assert!(matches!(outcome, SyncOutcome::Invalidated(_)));
        assert_eq!(store.get(&detail("X-1")), Some(json!({"id": "X-1"})));
        assert!(store.stale.lock().contains(&detail("X-1")));
    }

    #[test]
    fn test_panicking_merge_falls_back_to_invalidation() {
        let store = Arc::new(RecordingStore::default());
        store.entries.lock().insert(detail("X-1"), json!({"id": "X-1"}));
        let bridge = CacheSyncBridge::new(store.clone()).with_rule(
            "entity_updated",
            update_rule().with_merge(|_: &JsonValue, _: &JsonValue| -> Result<JsonValue> {
                panic!("merge exploded")
            }),
        );

        let outcome = bridge.apply("entity_updated", &json!({"entityId": "X-1"}));
        assert!(matches!(outcome, SyncOutcome::Invalidated(_)));
        assert!(store.sets.lock().is_empty());
    }

    #[test]
    fn test_unmapped_event_is_ignored() {
        let store = Arc::new(RecordingStore::default());
        let bridge = bridge(store.clone());
        assert_eq!(bridge.apply("job_progress", &json!({})), SyncOutcome::Ignored);
        assert!(store.stale.lock().is_empty());
    }

    #[test]
    fn test_attached_bridge_reacts_to_router() {
        let store = Arc::new(RecordingStore::default());
        let bridge = Arc::new(bridge(store.clone()));
        let router = EventRouter::new();
        bridge.attach(&router);
        assert_eq!(router.listener_count("entity_updated"), 1);

        router.emit("entity_updated", &json!({"entityId": "X-9"}));
        assert!(store.stale.lock().contains(&detail("X-9")));

        bridge.detach();
        assert_eq!(router.listener_count("entity_updated"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_burst_applies_last_payload_once() {
        let store = Arc::new(RecordingStore::default());
        let key = CacheKey::new(["job", "scan-1"]);
        store.entries.lock().insert(key.clone(), json!({"percent": 0}));
        let bridge = Arc::new(
            CacheSyncBridge::new(store.clone()).with_rule(
                "job_progress",
                SyncRule::new()
                    .with_detail_key(|p: &JsonValue| {
                        p.get("jobId")
                            .and_then(JsonValue::as_str)
                            .map(|id| CacheKey::new(["job", id]))
                    })
                    .with_merge(shallow_merge)
                    .with_coalesce(Duration::from_millis(200)),
            ),
        );

        for percent in [10, 20, 30] {
            bridge.handle("job_progress", &json!({"jobId": "scan-1", "percent": percent}));
        }
        assert!(store.sets.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.sets.lock().len(), 1);
        assert_eq!(store.get(&key).unwrap()["percent"], 30);
    }

    #[test]
    fn test_cache_key_display() {
        assert_eq!(CacheKey::new(["comments", "X-1"]).to_string(), "comments:X-1");
    }
}
