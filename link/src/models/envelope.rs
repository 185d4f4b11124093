use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One named event on the wire: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `entity_updated`
    pub event: String,

    /// JSON payload; `null` when the event carries none
    #[serde(default)]
    pub data: JsonValue,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
