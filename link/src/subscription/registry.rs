use crate::{
    error::{Result, TriageLinkError},
    models::{SubscriptionAck, SubscriptionInfo, SubscriptionStatus},
};
use serde_json::Value as JsonValue;
use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type SubscribeReply = oneshot::Sender<Result<SubscriptionAck>>;
pub(crate) type UnsubscribeReply = oneshot::Sender<Result<()>>;

/// Current time in millis since Unix epoch.
#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Entity id carried by a subscription-protocol payload (internal casing).
pub(crate) fn entity_id_of(payload: &JsonValue) -> Option<&str> {
    payload
        .get("entityId")
        .or_else(|| payload.get("id"))
        .and_then(JsonValue::as_str)
        .filter(|id| !id.is_empty())
}

/// Watcher list carried by an ack or a watchers-changed payload.
pub(crate) fn watchers_of(payload: &JsonValue) -> Option<Vec<JsonValue>> {
    payload.get("watchers").and_then(JsonValue::as_array).cloned()
}

/// An entry dropped because its acknowledgement never came.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Expired {
    pub entity_id: String,
    pub operation: &'static str,
}

struct Entry {
    status: SubscriptionStatus,
    requested_at_ms: u64,
    /// Ack deadline; `None` while the request is not on the wire
    deadline: Option<Instant>,
    /// Whether the subscribe request went out on the current connection
    sent: bool,
    subscribe_waiters: Vec<SubscribeReply>,
    unsubscribe_waiters: Vec<UnsubscribeReply>,
    watchers: Vec<JsonValue>,
}

impl Entry {
    fn pending(now_ms: u64) -> Self {
        Self {
            status: SubscriptionStatus::Pending,
            requested_at_ms: now_ms,
            deadline: None,
            sent: false,
            subscribe_waiters: Vec::new(),
            unsubscribe_waiters: Vec::new(),
            watchers: Vec::new(),
        }
    }

    fn ack(&self, entity_id: &str) -> SubscriptionAck {
        SubscriptionAck {
            entity_id: entity_id.to_string(),
            watchers: self.watchers.clone(),
        }
    }

    fn fail_subscribers(&mut self, err: &TriageLinkError) {
        for tx in self.subscribe_waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn release_unsubscribers(&mut self, outcome: Result<()>) {
        for tx in self.unsubscribe_waiters.drain(..) {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// Map of `entity_id` to subscription state.
///
/// At most one entry exists per entity. Every method returns what the
/// caller must put on the wire; the registry never performs I/O.
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    subscribe_timeout: Duration,
    unsubscribe_timeout: Duration,
}

impl SubscriptionRegistry {
    pub fn new(subscribe_timeout: Duration, unsubscribe_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            subscribe_timeout,
            unsubscribe_timeout,
        }
    }

    fn deadline_after(now: Instant, timeout: Duration) -> Option<Instant> {
        if timeout.is_zero() {
            None
        } else {
            Some(now + timeout)
        }
    }

    /// Register interest in `entity_id`. Returns `true` when a subscribe
    /// request must be sent now.
    ///
    /// While not connected the entry is queued as `Pending` and goes out
    /// with the next [`reissue`](Self::reissue).
    pub fn subscribe(
        &mut self,
        entity_id: &str,
        reply: SubscribeReply,
        now: Instant,
        connected: bool,
    ) -> bool {
        if let Some(entry) = self.entries.get_mut(entity_id) {
            let status = entry.status;
            match status {
                SubscriptionStatus::Active => {
                    let _ = reply.send(Ok(entry.ack(entity_id)));
                    return false;
                },
                SubscriptionStatus::Pending => {
                    entry.subscribe_waiters.push(reply);
                    return false;
                },
                SubscriptionStatus::PendingUnsubscribe => {
                    // A fresh subscribe supersedes the release in flight.
                    log::debug!(
                        "[triage-link] Subscribe for '{}' supersedes pending unsubscribe",
                        entity_id
                    );
                    entry.release_unsubscribers(Ok(()));
                    self.entries.remove(entity_id);
                },
            }
        }

        let mut entry = Entry::pending(now_ms());
        entry.subscribe_waiters.push(reply);
        if connected {
            entry.sent = true;
            entry.deadline = Self::deadline_after(now, self.subscribe_timeout);
        }
        self.entries.insert(entity_id.to_string(), entry);
        connected
    }

    /// Release interest in `entity_id`. Returns `true` when an unsubscribe
    /// request must be sent now.
    pub fn unsubscribe(
        &mut self,
        entity_id: &str,
        reply: UnsubscribeReply,
        now: Instant,
        connected: bool,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(entity_id) else {
            let _ = reply.send(Ok(()));
            return false;
        };

        let status = entry.status;
        match status {
            SubscriptionStatus::PendingUnsubscribe => {
                entry.unsubscribe_waiters.push(reply);
                false
            },
            SubscriptionStatus::Active if connected => {
                entry.status = SubscriptionStatus::PendingUnsubscribe;
                entry.deadline = Self::deadline_after(now, self.unsubscribe_timeout);
                entry.unsubscribe_waiters.push(reply);
                true
            },
            SubscriptionStatus::Active | SubscriptionStatus::Pending => {
                let was_sent = entry.sent;
                if let Some(mut entry) = self.entries.remove(entity_id) {
                    entry.fail_subscribers(&TriageLinkError::Cancelled);
                }
                let _ = reply.send(Ok(()));
                connected && was_sent
            },
        }
    }

    /// Subscribe acknowledged. Returns `false` for acks nobody waits for.
    pub fn on_subscribe_ack(&mut self, entity_id: &str, watchers: Vec<JsonValue>) -> bool {
        let Some(entry) = self.entries.get_mut(entity_id) else {
            log::debug!("[triage-link] Ignoring subscribe ack for unknown entity '{}'", entity_id);
            return false;
        };
        if entry.status != SubscriptionStatus::Pending {
            log::debug!(
                "[triage-link] Ignoring subscribe ack for '{}' in state {:?}",
                entity_id,
                entry.status
            );
            return false;
        }

        entry.status = SubscriptionStatus::Active;
        entry.deadline = None;
        entry.watchers = watchers;
        let ack = entry.ack(entity_id);
        for tx in entry.subscribe_waiters.drain(..) {
            let _ = tx.send(Ok(ack.clone()));
        }
        true
    }

    /// Subscribe acknowledged with an error: the entry returns to `None`.
    pub fn on_subscribe_rejected(&mut self, entity_id: &str, message: &str) -> bool {
        let pending = self
            .entries
            .get(entity_id)
            .is_some_and(|e| e.status == SubscriptionStatus::Pending);
        if !pending {
            return false;
        }
        if let Some(mut entry) = self.entries.remove(entity_id) {
            entry.fail_subscribers(&TriageLinkError::SubscriptionRejected {
                entity_id: entity_id.to_string(),
                message: message.to_string(),
            });
        }
        true
    }

    pub fn on_unsubscribe_ack(&mut self, entity_id: &str) -> bool {
        let releasing = self
            .entries
            .get(entity_id)
            .is_some_and(|e| e.status == SubscriptionStatus::PendingUnsubscribe);
        if !releasing {
            return false;
        }
        if let Some(mut entry) = self.entries.remove(entity_id) {
            entry.release_unsubscribers(Ok(()));
        }
        true
    }

    /// Store the latest watcher snapshot of a tracked entity.
    pub fn on_watchers_changed(&mut self, entity_id: &str, watchers: Vec<JsonValue>) -> bool {
        match self.entries.get_mut(entity_id) {
            Some(entry) => {
                entry.watchers = watchers;
                true
            },
            None => false,
        }
    }

    /// Earliest outstanding ack deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Drop every entry whose ack deadline has passed and fail its callers.
    ///
    /// Entries whose deadline was cleared by a state change are untouched,
    /// so a late timer is a no-op.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for entity_id in due {
            let Some(mut entry) = self.entries.remove(&entity_id) else {
                continue;
            };
            let operation = match entry.status {
                SubscriptionStatus::PendingUnsubscribe => "unsubscribe",
                _ => "subscribe",
            };
            let err = TriageLinkError::SubscriptionTimeout {
                entity_id: entity_id.clone(),
                operation,
            };
            log::warn!("[triage-link] {}", err);
            entry.fail_subscribers(&err);
            entry.release_unsubscribers(Err(err));
            expired.push(Expired {
                entity_id,
                operation,
            });
        }
        expired
    }

    /// Connection lost: every live entry becomes `Pending` and waits for
    /// [`reissue`](Self::reissue). Releases in flight are considered done
    /// since the server drops a closed socket's subscriptions.
    pub fn demote_all(&mut self) {
        self.entries.retain(|entity_id, entry| match entry.status {
            SubscriptionStatus::PendingUnsubscribe => {
                log::debug!("[triage-link] Releasing '{}' with the closed connection", entity_id);
                entry.release_unsubscribers(Ok(()));
                false
            },
            SubscriptionStatus::Active | SubscriptionStatus::Pending => {
                entry.status = SubscriptionStatus::Pending;
                entry.sent = false;
                entry.deadline = None;
                true
            },
        });
    }

    /// Connection established: mark every unsent `Pending` entry as sent and
    /// return the ids to subscribe, sorted for a stable wire order.
    pub fn reissue(&mut self, now: Instant) -> Vec<String> {
        let deadline = Self::deadline_after(now, self.subscribe_timeout);
        let mut ids: Vec<String> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| e.status == SubscriptionStatus::Pending && !e.sent)
            .map(|(id, e)| {
                e.sent = true;
                e.deadline = deadline;
                e.requested_at_ms = now_ms();
                id.clone()
            })
            .collect();
        ids.sort();
        ids
    }

    /// Ids the server currently holds for us.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.status == SubscriptionStatus::Active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Fail every caller still waiting on a subscribe, keeping the entries.
    pub fn fail_waiters(&mut self, err: &TriageLinkError) {
        for entry in self.entries.values_mut() {
            entry.fail_subscribers(err);
        }
    }

    /// Teardown: drop everything and fail every waiter with `err`.
    pub fn clear(&mut self, err: &TriageLinkError) {
        for (_, mut entry) in self.entries.drain() {
            entry.fail_subscribers(err);
            entry.release_unsubscribers(Err(err.clone()));
        }
    }

    pub fn info(&self, entity_id: &str) -> Option<SubscriptionInfo> {
        self.entries.get(entity_id).map(|entry| SubscriptionInfo {
            entity_id: entity_id.to_string(),
            status: entry.status,
            requested_at_ms: entry.requested_at_ms,
            watchers: entry.watchers.clone(),
        })
    }

    #[cfg(test)]
    pub fn status(&self, entity_id: &str) -> Option<SubscriptionStatus> {
        self.entries.get(entity_id).map(|e| e.status)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    fn reply<T>() -> (oneshot::Sender<Result<T>>, oneshot::Receiver<Result<T>>) {
        oneshot::channel()
    }

    #[test]
    fn test_subscribe_sends_once_and_joins_pending() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx1, mut rx1) = reply();
        let (tx2, mut rx2) = reply();

        assert!(reg.subscribe("X-1", tx1, now, true));
        assert!(!reg.subscribe("X-1", tx2, now, true));
        assert_eq!(reg.status("X-1"), Some(SubscriptionStatus::Pending));
        assert_eq!(reg.len(), 1);

        assert!(reg.on_subscribe_ack("X-1", vec![json!({"userId": "u-1"})]));
        let first = rx1.try_recv().unwrap().unwrap();
        let second = rx2.try_recv().unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.watchers.len(), 1);
        assert_eq!(reg.status("X-1"), Some(SubscriptionStatus::Active));
        assert_eq!(reg.next_deadline(), None);
    }

    #[test]
    fn test_subscribe_while_active_is_noop_success() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        reg.on_subscribe_ack("X-1", vec![]);

        let (tx, mut rx) = reply();
        assert!(!reg.subscribe("X-1", tx, now, true));
        assert_eq!(rx.try_recv().unwrap().unwrap().entity_id, "X-1");
    }

    #[test]
    fn test_subscribe_timeout_returns_entry_to_none() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(5)));

        assert!(reg.expire(now + Duration::from_secs(4)).is_empty());
        let expired = reg.expire(now + Duration::from_secs(5));
        assert_eq!(
            expired,
            vec![Expired {
                entity_id: "X-1".into(),
                operation: "subscribe"
            }]
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TriageLinkError::SubscriptionTimeout { operation: "subscribe", .. })
        ));
        assert_eq!(reg.status("X-1"), None);
    }

    #[test]
    fn test_unsubscribe_flow() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        reg.on_subscribe_ack("X-1", vec![]);

        let (tx1, mut rx1) = reply();
        let (tx2, mut rx2) = reply();
        assert!(reg.unsubscribe("X-1", tx1, now, true));
        assert!(!reg.unsubscribe("X-1", tx2, now, true));
        assert_eq!(reg.status("X-1"), Some(SubscriptionStatus::PendingUnsubscribe));

        assert!(reg.on_unsubscribe_ack("X-1"));
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().unwrap().is_ok());
        assert_eq!(reg.status("X-1"), None);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut reg = registry();
        let (tx, mut rx) = reply();
        assert!(!reg.unsubscribe("nope", tx, Instant::now(), true));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_unsubscribe_timeout_force_removes() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        reg.on_subscribe_ack("X-1", vec![]);
        let (tx, mut rx) = reply();
        reg.unsubscribe("X-1", tx, now, true);

        let expired = reg.expire(now + Duration::from_secs(5));
        assert_eq!(expired[0].operation, "unsubscribe");
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TriageLinkError::SubscriptionTimeout { operation: "unsubscribe", .. })
        ));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_unsubscribe_while_pending_cancels_subscribers() {
        let mut reg = registry();
        let now = Instant::now();
        let (sub_tx, mut sub_rx) = reply();
        reg.subscribe("X-1", sub_tx, now, true);

        let (tx, mut rx) = reply();
        assert!(reg.unsubscribe("X-1", tx, now, true));
        assert!(matches!(sub_rx.try_recv().unwrap(), Err(TriageLinkError::Cancelled)));
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_demote_and_reissue_survive_reconnect() {
        let mut reg = registry();
        let now = Instant::now();
        for id in ["B-2", "A-1"] {
            let (tx, _rx) = reply();
            reg.subscribe(id, tx, now, true);
            reg.on_subscribe_ack(id, vec![]);
        }

        reg.demote_all();
        assert_eq!(reg.status("A-1"), Some(SubscriptionStatus::Pending));
        assert_eq!(reg.next_deadline(), None);
        assert!(reg.active_ids().is_empty());

        let later = now + Duration::from_secs(60);
        assert_eq!(reg.reissue(later), vec!["A-1".to_string(), "B-2".to_string()]);
        assert_eq!(reg.next_deadline(), Some(later + Duration::from_secs(5)));
        // already on the wire
        assert!(reg.reissue(later).is_empty());

        assert!(reg.on_subscribe_ack("A-1", vec![]));
        assert_eq!(reg.active_ids(), vec!["A-1".to_string()]);
    }

    #[test]
    fn test_subscribe_while_offline_waits_for_reissue() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, mut rx) = reply();
        assert!(!reg.subscribe("X-1", tx, now, false));
        assert_eq!(reg.next_deadline(), None);
        assert!(rx.try_recv().is_err());

        assert_eq!(reg.reissue(now), vec!["X-1".to_string()]);
        reg.on_subscribe_ack("X-1", vec![]);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_demote_releases_pending_unsubscribe() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        reg.on_subscribe_ack("X-1", vec![]);
        let (tx, mut rx) = reply();
        reg.unsubscribe("X-1", tx, now, true);

        reg.demote_all();
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_late_ack_after_timeout_is_ignored() {
        let mut reg = registry();
        let now = Instant::now();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, now, true);
        reg.expire(now + Duration::from_secs(10));

        assert!(!reg.on_subscribe_ack("X-1", vec![]));
        assert_eq!(reg.status("X-1"), None);
    }

    #[test]
    fn test_rejected_ack_fails_callers() {
        let mut reg = registry();
        let (tx, mut rx) = reply();
        reg.subscribe("X-1", tx, Instant::now(), true);

        assert!(reg.on_subscribe_rejected("X-1", "forbidden"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TriageLinkError::SubscriptionRejected { .. })
        ));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_watchers_snapshot_is_exposed() {
        let mut reg = registry();
        let (tx, _rx) = reply();
        reg.subscribe("X-1", tx, Instant::now(), true);
        reg.on_subscribe_ack("X-1", vec![json!("u-1")]);
        assert!(reg.on_watchers_changed("X-1", vec![json!("u-1"), json!("u-2")]));
        assert!(!reg.on_watchers_changed("X-2", vec![]));

        let info = reg.info("X-1").unwrap();
        assert_eq!(info.status, SubscriptionStatus::Active);
        assert_eq!(info.watchers.len(), 2);
        assert!(info.requested_at_ms > 0);
    }

    #[test]
    fn test_clear_fails_everyone() {
        let mut reg = registry();
        let (tx, mut rx) = reply();
        reg.subscribe("X-1", tx, Instant::now(), true);
        reg.clear(&TriageLinkError::Cancelled);
        assert!(matches!(rx.try_recv().unwrap(), Err(TriageLinkError::Cancelled)));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_payload_helpers() {
        let payload = json!({"entityId": "X-1", "watchers": [{"userId": "u"}]});
        assert_eq!(entity_id_of(&payload), Some("X-1"));
        assert_eq!(watchers_of(&payload).map(|w| w.len()), Some(1));
        assert_eq!(entity_id_of(&json!({"entityId": ""})), None);
        assert_eq!(entity_id_of(&json!({"id": "X-2"})), Some("X-2"));
    }
}
