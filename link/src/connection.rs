//! Connection manager: one socket, one background task.
//!
//! Handles:
//!
//! - The `Disconnected → Connecting → Connected → Reconnecting → Failed`
//!   state machine
//! - Handshake (`connect` with a socket id, or `connect_error`)
//! - Exponential backoff with jitter between reconnect attempts
//! - Application heartbeats and per-entity subscriptions
//! - Normalizing, deduplicating and routing every inbound event
//!
//! This module holds the wire helpers; the task lives in `shared`.

mod shared;

pub(crate) use shared::{spawn_engine, ConnCmd, EngineConfig, EngineHandle, WeakEngine};

use crate::{
    error::{Result, TriageLinkError},
    models::{event_names, ConnectionOptions, Envelope},
};
use rand::Rng;
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;

/// Frames larger than this are dropped.
pub(crate) const MAX_FRAME_BYTES: usize = 16 << 20;

/// Maximum sleep duration that won't overflow `Instant + Duration`.
/// ~100 years is far enough into the future to be effectively "never".
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Server disconnect reasons that mean "your credential is no longer
/// accepted" rather than "the network hiccuped".
const AUTH_DISCONNECT_REASONS: &[&str] = &["io server disconnect", "unauthorized"];

/// Build the websocket URL from the configured base URL.
///
/// `http` becomes `ws`, `https` becomes `wss`; `ws_path` is appended to any
/// path prefix the base URL carries.
pub(crate) fn resolve_ws_url(base_url: &str, ws_path: &str) -> Result<String> {
    let base = Url::parse(base_url.trim()).map_err(|e| {
        TriageLinkError::ConfigurationError(format!("Invalid base_url '{}': {}", base_url, e))
    })?;

    if base.host_str().is_none() {
        return Err(TriageLinkError::ConfigurationError(
            "base_url must include a host".to_string(),
        ));
    }
    if !base.username().is_empty() || base.password().is_some() {
        return Err(TriageLinkError::ConfigurationError(
            "base_url must not include username/password credentials".to_string(),
        ));
    }

    let ws_scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TriageLinkError::ConfigurationError(format!(
                "Unsupported base_url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        },
    };

    let mut ws_url = base.clone();
    ws_url.set_scheme(ws_scheme).map_err(|_| {
        TriageLinkError::ConfigurationError("Failed to set WebSocket URL scheme".to_string())
    })?;
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        ws_path.trim_start_matches('/')
    );
    ws_url.set_path(&path);
    ws_url.set_query(None);
    ws_url.set_fragment(None);

    Ok(ws_url.to_string())
}

/// Backoff before the retry following `attempt` failures, randomized by
/// `reconnect_jitter_ratio` in both directions and never above the cap.
pub(crate) fn jittered_backoff(options: &ConnectionOptions, attempt: u32) -> Duration {
    let base = options.backoff_delay(attempt);
    let ratio = options.reconnect_jitter_ratio;
    if ratio.is_nan() || ratio <= 0.0 || base.is_zero() {
        return base;
    }

    let ratio = ratio.min(1.0);
    let factor = 1.0 + rand::rng().random_range(-ratio..=ratio);
    let jittered_ms = (base.as_millis() as f64 * factor).round().max(0.0) as u64;
    Duration::from_millis(jittered_ms.min(options.max_reconnect_delay_ms))
}

/// `true` if a server `disconnect` reason forbids automatic reconnection.
pub(crate) fn is_auth_disconnect(reason: &str) -> bool {
    let reason = reason.trim().to_ascii_lowercase();
    AUTH_DISCONNECT_REASONS.iter().any(|r| *r == reason)
}

/// Encode one outbound event. `data` must already be in wire casing.
pub(crate) fn encode_frame(event: &str, data: JsonValue) -> Result<String> {
    serde_json::to_string(&Envelope::new(event, data)).map_err(|e| {
        TriageLinkError::SerializationError(format!("Failed to serialize '{}': {}", event, e))
    })
}

/// Decode one inbound text frame.
///
/// Accepts `{"event": name, "data": payload}` and `[name, payload]`. A
/// frame without an event name is salvaged as `entity_watchers_changed`
/// when its payload names an entity and carries a watcher list; anything
/// else is a protocol error and the frame is dropped by the caller.
pub(crate) fn parse_frame(text: &str) -> Result<Envelope> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(TriageLinkError::ProtocolError(format!(
            "Frame too large ({} bytes)",
            text.len()
        )));
    }

    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| TriageLinkError::ProtocolError(format!("Malformed frame: {}", e)))?;

    match value {
        JsonValue::Object(mut map) => {
            let data = map.remove("data");
            match map.remove("event") {
                Some(JsonValue::String(event)) if !event.is_empty() => {
                    Ok(Envelope::new(event, data.unwrap_or(JsonValue::Null)))
                },
                _ => {
                    let payload = data.unwrap_or(JsonValue::Object(map));
                    salvage(payload)
                },
            }
        },
        JsonValue::Array(mut items) if !items.is_empty() => {
            let data = if items.len() > 1 {
                items.swap_remove(1)
            } else {
                JsonValue::Null
            };
            match &items[0] {
                JsonValue::String(event) if !event.is_empty() => {
                    Ok(Envelope::new(event.clone(), data))
                },
                _ => salvage(data),
            }
        },
        _ => Err(TriageLinkError::ProtocolError(
            "Frame is neither an envelope nor an event array".to_string(),
        )),
    }
}

fn salvage(payload: JsonValue) -> Result<Envelope> {
    let has_entity = ["entity_id", "entityId"]
        .iter()
        .any(|k| payload.get(*k).and_then(JsonValue::as_str).is_some_and(|s| !s.is_empty()));
    let has_watchers = payload.get("watchers").is_some_and(JsonValue::is_array);

    if has_entity && has_watchers {
        log::debug!("[triage-link] Salvaged unnamed frame as watcher update");
        Ok(Envelope::new(event_names::ENTITY_WATCHERS_CHANGED, payload))
    } else {
        Err(TriageLinkError::ProtocolError("Frame has no event name".to_string()))
    }
}
