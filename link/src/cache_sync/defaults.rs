//! Built-in mapping table for the tracker's business events.
//!
//! Cache layout assumed by these rules:
//!
//! | key                      | holds                          |
//! |--------------------------|--------------------------------|
//! | `entities`               | entity list views              |
//! | `entity:<entityId>`      | one entity detail object       |
//! | `comments:<entityId>`    | comment thread of an entity    |
//! | `job:<jobId>`            | long-running job status object |

use super::{CacheKey, SyncRule};
use crate::{
    error::{Result, TriageLinkError},
    models::event_names,
};
use serde_json::Value as JsonValue;
use std::time::Duration;

pub const ENTITY_LIST: &str = "entities";

const REACTION_COALESCE: Duration = Duration::from_millis(250);
const JOB_PROGRESS_COALESCE: Duration = Duration::from_millis(200);

pub fn entity_key(entity_id: &str) -> CacheKey {
    CacheKey::new(["entity", entity_id])
}

pub fn comments_key(entity_id: &str) -> CacheKey {
    CacheKey::new(["comments", entity_id])
}

pub fn job_key(job_id: &str) -> CacheKey {
    CacheKey::new(["job", job_id])
}

fn str_field<'a>(payload: &'a JsonValue, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
}

/// Copy the top-level fields of `patch` over `cached`.
///
/// Both sides must be objects. Nested objects are replaced, not merged.
pub fn shallow_merge(cached: &JsonValue, patch: &JsonValue) -> Result<JsonValue> {
    let (Some(base), Some(fields)) = (cached.as_object(), patch.as_object()) else {
        return Err(TriageLinkError::ProtocolError(
            "shallow merge needs two JSON objects".to_string(),
        ));
    };
    let mut merged = base.clone();
    for (key, value) in fields {
        merged.insert(key.clone(), value.clone());
    }
    Ok(JsonValue::Object(merged))
}

/// `entity_updated` carries either `changes` (a partial object) or the full
/// `entity`; the entity id itself is not merged.
fn merge_entity_update(cached: &JsonValue, payload: &JsonValue) -> Result<JsonValue> {
    let patch = payload
        .get("changes")
        .or_else(|| payload.get("entity"))
        .ok_or_else(|| {
            TriageLinkError::ProtocolError("entity_updated without changes".to_string())
        })?;
    shallow_merge(cached, patch)
}

/// Append the new comment to a cached thread unless it is already there.
fn merge_comment_added(cached: &JsonValue, payload: &JsonValue) -> Result<JsonValue> {
    let comment = payload
        .get("comment")
        .filter(|c| c.is_object())
        .ok_or_else(|| {
            TriageLinkError::ProtocolError("comment_added without comment".to_string())
        })?;
    let mut thread = cached
        .as_array()
        .cloned()
        .ok_or_else(|| TriageLinkError::ProtocolError("cached thread is not a list".to_string()))?;

    let id = comment.get("id");
    if id.is_some() && thread.iter().any(|c| c.get("id") == id) {
        return Ok(JsonValue::Array(thread));
    }
    thread.push(comment.clone());
    Ok(JsonValue::Array(thread))
}

/// Replace the reaction totals of one comment in a cached thread.
fn merge_reactions(cached: &JsonValue, payload: &JsonValue) -> Result<JsonValue> {
    let comment_id = payload.get("commentId").ok_or_else(|| {
        TriageLinkError::ProtocolError("reaction change without commentId".to_string())
    })?;
    let reactions = payload.get("reactions").cloned().unwrap_or(JsonValue::Null);
    let mut thread = cached
        .as_array()
        .cloned()
        .ok_or_else(|| TriageLinkError::ProtocolError("cached thread is not a list".to_string()))?;

    let comment = thread
        .iter_mut()
        .find(|c| c.get("id") == Some(comment_id))
        .and_then(JsonValue::as_object_mut)
        .ok_or_else(|| TriageLinkError::ProtocolError("comment not in cached thread".to_string()))?;
    comment.insert("reactions".to_string(), reactions);
    Ok(JsonValue::Array(thread))
}

fn comment_thread_rule() -> SyncRule {
    SyncRule::new().with_detail_key(|p: &JsonValue| str_field(p, "entityId").map(comments_key))
}

/// The tracker's mapping table, keyed by event name.
pub fn default_rules() -> Vec<(String, SyncRule)> {
    let list = CacheKey::new([ENTITY_LIST]);
    let entity_detail = |p: &JsonValue| str_field(p, "entityId").map(entity_key);

    vec![
        (
            event_names::ENTITY_CREATED.to_string(),
            SyncRule::new().invalidate(list.clone()),
        ),
        (
            event_names::ENTITY_UPDATED.to_string(),
            SyncRule::new()
                .invalidate(list.clone())
                .with_detail_key(entity_detail)
                .with_merge(merge_entity_update),
        ),
        (
            event_names::ENTITY_DELETED.to_string(),
            SyncRule::new()
                .invalidate(list)
                .with_detail_key(entity_detail),
        ),
        (
            event_names::COMMENT_ADDED.to_string(),
            comment_thread_rule().with_merge(merge_comment_added),
        ),
        (event_names::COMMENT_UPDATED.to_string(), comment_thread_rule()),
        (event_names::COMMENT_DELETED.to_string(), comment_thread_rule()),
        (
            event_names::COMMENT_REACTION_CHANGED.to_string(),
            comment_thread_rule()
                .with_merge(merge_reactions)
                .with_coalesce(REACTION_COALESCE),
        ),
        (
            event_names::JOB_PROGRESS.to_string(),
            SyncRule::new()
                .with_detail_key(|p: &JsonValue| str_field(p, "jobId").map(job_key))
                .with_merge(shallow_merge)
                .with_coalesce(JOB_PROGRESS_COALESCE),
        ),
    ]
}
