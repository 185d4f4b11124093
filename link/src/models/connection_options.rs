use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::event_names;
use crate::normalize::KeyCase;

/// Connection-level options for the synchronization engine.
///
/// These options control:
/// - Automatic reconnection and its exponential backoff
/// - Which high-frequency events are deduplicated, and over what window
/// - Payload key casing on the wire and internally
///
/// Timer durations live in [`TriageLinkTimeouts`](crate::TriageLinkTimeouts).
///
/// # Example
///
/// ```rust
/// use triage_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_reconnect_delay_ms(2000)
///     .with_max_reconnect_attempts(Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Enable automatic reconnection on connection loss
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Base delay in milliseconds for the first reconnection attempt
    /// Default: 1000ms
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Multiplier applied per attempt: `base * factor^attempt`
    /// Default: 2.0
    #[serde(default = "default_reconnect_growth_factor")]
    pub reconnect_growth_factor: f64,

    /// Upper bound for the backoff delay
    /// Default: 30000ms (30 seconds)
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Fraction of the delay randomized in both directions (0.0 disables)
    /// Default: 0.2 (±20%)
    #[serde(default = "default_reconnect_jitter_ratio")]
    pub reconnect_jitter_ratio: f64,

    /// Retries allowed before entering `Failed`
    /// Default: Some(10). None retries forever; Some(0) fails on the first drop
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: Option<u32>,

    /// Path appended to the base URL for the websocket endpoint
    /// Default: "/ws"
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Window in which an identical low-value event is suppressed
    /// Default: 500ms
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Maximum fingerprints remembered; oldest are evicted first
    /// Default: 256
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,

    /// Event names eligible for deduplication. Business events must never
    /// appear here.
    #[serde(default = "default_dedup_events")]
    pub dedup_events: Vec<String>,

    /// Key casing used on the wire
    /// Default: snake_case
    #[serde(default = "default_wire_case")]
    pub wire_case: KeyCase,

    /// Key casing handed to listeners
    /// Default: camelCase
    #[serde(default = "default_internal_case")]
    pub internal_case: KeyCase,

    /// Field names whose key and subtree are never re-cased
    #[serde(default = "default_case_exclusions")]
    pub case_exclusions: Vec<String>,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_reconnect_growth_factor() -> f64 {
    2.0
}

fn default_max_reconnect_delay_ms() -> u64 {
    30000
}

fn default_reconnect_jitter_ratio() -> f64 {
    0.2
}

fn default_max_reconnect_attempts() -> Option<u32> {
    Some(10)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_dedup_window_ms() -> u64 {
    500
}

fn default_dedup_max_entries() -> usize {
    256
}

fn default_dedup_events() -> Vec<String> {
    vec![
        event_names::PING.to_string(),
        event_names::PONG.to_string(),
        event_names::JOB_PROGRESS.to_string(),
    ]
}

fn default_wire_case() -> KeyCase {
    KeyCase::Snake
}

fn default_internal_case() -> KeyCase {
    KeyCase::Camel
}

fn default_case_exclusions() -> Vec<String> {
    ["metadata", "custom_fields", "raw", "cvss_vector", "headers"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_growth_factor: default_reconnect_growth_factor(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            reconnect_jitter_ratio: default_reconnect_jitter_ratio(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ws_path: default_ws_path(),
            dedup_window_ms: default_dedup_window_ms(),
            dedup_max_entries: default_dedup_max_entries(),
            dedup_events: default_dedup_events(),
            wire_case: default_wire_case(),
            internal_case: default_internal_case(),
            case_exclusions: default_case_exclusions(),
        }
    }
}

impl ConnectionOptions {
    /// Create new connection options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the base delay between reconnection attempts (in milliseconds)
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the per-attempt backoff multiplier
    pub fn with_reconnect_growth_factor(mut self, factor: f64) -> Self {
        self.reconnect_growth_factor = factor;
        self
    }

    /// Set the maximum delay between reconnection attempts (in milliseconds)
    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    /// Set the jitter ratio; 0.0 makes backoff deterministic
    pub fn with_reconnect_jitter_ratio(mut self, ratio: f64) -> Self {
        self.reconnect_jitter_ratio = ratio;
        self
    }

    /// Set the maximum number of reconnection attempts
    /// Pass None for infinite retries
    pub fn with_max_reconnect_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set the websocket endpoint path
    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Set the deduplication window (in milliseconds)
    pub fn with_dedup_window_ms(mut self, window_ms: u64) -> Self {
        self.dedup_window_ms = window_ms;
        self
    }

    /// Replace the deduplication allow-list
    pub fn with_dedup_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_events = events.into_iter().map(Into::into).collect();
        self
    }

    /// Set wire and internal key casing
    pub fn with_key_cases(mut self, wire: KeyCase, internal: KeyCase) -> Self {
        self.wire_case = wire;
        self.internal_case = internal;
        self
    }

    /// Replace the list of field names exempt from re-casing
    pub fn with_case_exclusions<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.case_exclusions = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Un-jittered backoff for the given zero-based attempt:
    /// `min(base * factor^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_delay_ms as f64;
        let factor = self.reconnect_growth_factor.max(1.0);
        let exponent = attempt.min(64) as i32;
        let raw = base * factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_reconnect_delay_ms as f64)
        } else {
            self.max_reconnect_delay_ms as f64
        };
        Duration::from_millis(capped as u64)
    }
}
