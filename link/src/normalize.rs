//! Payload key-casing normalization.
//!
//! The server speaks one key convention (snake_case by default) and
//! listeners consume another (camelCase by default). Every inbound payload
//! is re-cased before publication and every outbound payload before
//! transmission, recursively through objects and arrays.
//!
//! Keys are left untouched when:
//! - the field name is on the exclusion list (its whole subtree is kept
//!   verbatim, e.g. free-form `metadata` maps)
//! - the key is not identifier-shaped (UUIDs, timestamps, anything starting
//!   with a digit or containing characters outside `[A-Za-z0-9_]`)
//! - the key starts with a capital letter (`ID`, `CVSS`, `URL`); lowering it
//!   could not be undone on the way back
//!
//! Both conversions are idempotent, so normalizing an already normalized
//! payload is harmless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;

/// Key naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCase {
    /// `cvss_score`
    Snake,
    /// `cvssScore`
    Camel,
}

impl KeyCase {
    /// Convert a single key into this case.
    pub fn apply(&self, key: &str) -> String {
        match self {
            Self::Snake => to_snake_case(key),
            Self::Camel => to_camel_case(key),
        }
    }
}

/// Stateless bidirectional key transform between wire and internal case.
#[derive(Debug, Clone)]
pub struct CaseNormalizer {
    wire: KeyCase,
    internal: KeyCase,
    excluded: HashSet<String>,
}

impl Default for CaseNormalizer {
    fn default() -> Self {
        Self::new(KeyCase::Snake, KeyCase::Camel, std::iter::empty::<String>())
    }
}

impl CaseNormalizer {
    pub fn new<I, S>(wire: KeyCase, internal: KeyCase, excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            wire,
            internal,
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    /// Wire payload to internal convention.
    pub fn inbound(&self, value: JsonValue) -> JsonValue {
        self.transform(value, self.internal)
    }

    /// Internal payload to wire convention.
    pub fn outbound(&self, value: JsonValue) -> JsonValue {
        self.transform(value, self.wire)
    }

    fn is_excluded(&self, key: &str) -> bool {
        if self.excluded.is_empty() {
            return false;
        }
        self.excluded.contains(key)
            || self.excluded.contains(&to_snake_case(key))
            || self.excluded.contains(&to_camel_case(key))
    }

    fn transform(&self, value: JsonValue, target: KeyCase) -> JsonValue {
        match value {
            JsonValue::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    if self.is_excluded(&key) {
                        out.insert(key, child);
                    } else if !is_identifier_key(&key) {
                        // Opaque keys (ids, timestamps) keep their spelling
                        // but their values are still ordinary payload.
                        out.insert(key, self.transform(child, target));
                    } else {
                        out.insert(target.apply(&key), self.transform(child, target));
                    }
                }
                JsonValue::Object(out)
            },
            JsonValue::Array(items) => JsonValue::Array(
                items.into_iter().map(|item| self.transform(item, target)).collect(),
            ),
            other => other,
        }
    }
}

/// `_*[a-z][A-Za-z0-9_]*`, or underscores only.
fn is_identifier_key(key: &str) -> bool {
    let body = key.trim_start_matches('_');
    let mut chars = body.chars();
    match chars.next() {
        None => return !key.is_empty(),
        Some(c) if c.is_ascii_lowercase() => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `cvssScore` -> `cvss_score`. Leading underscores are preserved.
pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev: Option<char> = None;
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if let Some(p) = prev {
                if p != '_' {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

/// `cvss_score` -> `cvssScore`. Leading and trailing underscores are
/// preserved; an underscore followed by a digit is kept so `cvss_3` does not
/// collapse into an ambiguous `cvss3`.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut seen_body = false;
    let mut upper_next = false;
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' {
            let next_is_lower = chars.peek().is_some_and(|n| n.is_ascii_lowercase());
            if seen_body && next_is_lower {
                upper_next = true;
            } else {
                out.push(c);
            }
            continue;
        }
        if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
        seen_body = true;
    }
    out
}
