//! Subscription metadata exposed to callers.
//!
//! [`SubscriptionInfo`] provides a read-only snapshot of one entity
//! subscription, useful for debugging, tests and watcher avatars in the UI.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Lifecycle of one entity subscription. Absence from the registry is the
/// implicit `None` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscribe sent (or queued until connected), awaiting ack
    Pending,
    /// Acknowledged by the server
    Active,
    /// Unsubscribe sent, awaiting ack
    PendingUnsubscribe,
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub entity_id: String,
    /// Watchers reported by the server at acknowledgement time
    #[serde(default)]
    pub watchers: Vec<JsonValue>,
}

/// Read-only snapshot of a subscription's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub entity_id: String,
    pub status: SubscriptionStatus,
    /// Millis since Unix epoch of the latest subscribe request
    pub requested_at_ms: u64,
    /// Latest watcher snapshot from an ack or a watchers-changed event
    pub watchers: Vec<JsonValue>,
}
