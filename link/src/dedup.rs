//! Short-window suppression of repeated low-value events.
//!
//! Only event names on the allow-list are considered. Business events
//! (entity created/updated/deleted, comments) are never suppressed because
//! dropping one would leave the cache wrong.

use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// Bounded memo of recently seen `(event, payload)` fingerprints.
#[derive(Debug)]
pub struct DeduplicationCache {
    window: Duration,
    max_entries: usize,
    allow_list: HashSet<String>,
    /// Insertion order, oldest first. May hold superseded entries whose
    /// timestamp no longer matches `last_seen`.
    order: VecDeque<(u64, Instant)>,
    last_seen: HashMap<u64, Instant>,
}

impl DeduplicationCache {
    pub fn new<I, S>(window: Duration, max_entries: usize, allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            window,
            max_entries: max_entries.max(1),
            allow_list: allow_list.into_iter().map(Into::into).collect(),
            order: VecDeque::new(),
            last_seen: HashMap::new(),
        }
    }

    /// `true` if the event is an allow-listed repeat seen within the window
    /// and must be dropped before it reaches the router.
    pub fn should_suppress(&mut self, event: &str, payload: &JsonValue) -> bool {
        self.should_suppress_at(event, payload, Instant::now())
    }

    pub(crate) fn should_suppress_at(
        &mut self,
        event: &str,
        payload: &JsonValue,
        now: Instant,
    ) -> bool {
        if !self.allow_list.contains(event) {
            return false;
        }

        self.evict_expired(now);

        let key = fingerprint(event, payload);
        if let Some(seen) = self.last_seen.get(&key) {
            if now.saturating_duration_since(*seen) < self.window {
                return true;
            }
        }

        self.last_seen.insert(key, now);
        self.order.push_back((key, now));
        while self.last_seen.len() > self.max_entries {
            self.evict_oldest();
        }
        false
    }

    /// Number of live fingerprints.
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.last_seen.clear();
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(key, at)) = self.order.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            if self.last_seen.get(&key) == Some(&at) {
                self.last_seen.remove(&key);
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((key, at)) = self.order.pop_front() {
            if self.last_seen.get(&key) == Some(&at) {
                self.last_seen.remove(&key);
                return;
            }
        }
    }
}

/// Stable fingerprint of `(event, payload)`.
///
/// `serde_json::Map` keeps keys sorted, so the serialized form is stable
/// regardless of the order the server emitted fields in.
fn fingerprint(event: &str, payload: &JsonValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    event.hash(&mut hasher);
    0u8.hash(&mut hasher);
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}
