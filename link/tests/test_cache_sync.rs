//! Cache updates driven end to end by server events.

mod common;

use common::Harness;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use triage_link::{
    cache_sync::{comments_key, entity_key, job_key, ENTITY_LIST},
    event_names, CacheKey, CacheStore,
};

#[derive(Default)]
struct TestCache {
    entries: Mutex<HashMap<CacheKey, JsonValue>>,
    stale: Mutex<Vec<CacheKey>>,
}

impl TestCache {
    fn seed(&self, key: CacheKey, value: JsonValue) {
        self.entries.lock().insert(key, value);
    }

    fn value(&self, key: &CacheKey) -> Option<JsonValue> {
        self.entries.lock().get(key).cloned()
    }

    fn stale(&self) -> Vec<CacheKey> {
        self.stale.lock().clone()
    }
}

impl CacheStore for TestCache {
    fn get(&self, key: &CacheKey) -> Option<JsonValue> {
        self.value(key)
    }

    fn set(&self, key: &CacheKey, value: JsonValue) {
        self.entries.lock().insert(key.clone(), value);
    }

    fn mark_stale(&self, key: &CacheKey) {
        self.stale.lock().push(key.clone());
    }
}

async fn harness_with_cache() -> (Harness, Arc<TestCache>, triage_link::ServerConnection) {
    let cache = Arc::new(TestCache::default());
    let store = cache.clone();
    let mut h = Harness::build(move |b| b.cache_store(store));
    let conn = h.connect("sock-1").await;
    (h, cache, conn)
}

#[tokio::test(start_paused = true)]
async fn test_entity_update_merges_cached_detail() {
    let (_h, cache, conn) = harness_with_cache().await;
    cache.seed(entity_key("VULN-1"), json!({"id": "VULN-1", "status": "open", "cvssScore": 5.0}));

    conn.send_event(
        event_names::ENTITY_UPDATED,
        json!({"entity_id": "VULN-1", "changes": {"status": "fixed", "cvss_score": 7.5}}),
    );
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        cache.value(&entity_key("VULN-1")).unwrap(),
        json!({"id": "VULN-1", "status": "fixed", "cvssScore": 7.5})
    );
    assert!(cache.stale().is_empty(), "a merge skips invalidation");
}

#[tokio::test(start_paused = true)]
async fn test_entity_update_without_cached_detail_invalidates() {
    let (_h, cache, conn) = harness_with_cache().await;

    conn.send_event(
        event_names::ENTITY_UPDATED,
        json!({"entity_id": "VULN-2", "changes": {"status": "fixed"}}),
    );
    sleep(Duration::from_millis(10)).await;

    assert!(cache.value(&entity_key("VULN-2")).is_none(), "never creates entries");
    let stale = cache.stale();
    assert!(stale.contains(&CacheKey::new([ENTITY_LIST])));
    assert!(stale.contains(&entity_key("VULN-2")));
}

#[tokio::test(start_paused = true)]
async fn test_created_and_deleted_invalidate() {
    let (_h, cache, conn) = harness_with_cache().await;

    conn.send_event(event_names::ENTITY_CREATED, json!({"entity_id": "VULN-3"}));
    conn.send_event(event_names::ENTITY_DELETED, json!({"entity_id": "VULN-4"}));
    sleep(Duration::from_millis(10)).await;

    let stale = cache.stale();
    assert_eq!(stale.iter().filter(|k| k.to_string() == ENTITY_LIST).count(), 2);
    assert!(stale.contains(&entity_key("VULN-4")));
}

#[tokio::test(start_paused = true)]
async fn test_comment_added_appends_to_thread() {
    let (_h, cache, conn) = harness_with_cache().await;
    cache.seed(comments_key("VULN-1"), json!([{"id": "c-1", "body": "first"}]));

    let added = json!({"entity_id": "VULN-1", "comment": {"id": "c-2", "body": "second"}});
    conn.send_event(event_names::COMMENT_ADDED, added.clone());
    // Redelivery of the same comment does not duplicate it.
    conn.send_event(event_names::COMMENT_ADDED, added);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        cache.value(&comments_key("VULN-1")).unwrap(),
        json!([{"id": "c-1", "body": "first"}, {"id": "c-2", "body": "second"}])
    );
}

#[tokio::test(start_paused = true)]
async fn test_reaction_burst_is_coalesced() {
    let (_h, cache, conn) = harness_with_cache().await;
    cache.seed(comments_key("VULN-1"), json!([{"id": "c-1", "reactions": {}}]));

    for count in 1..=5 {
        conn.send_event(
            event_names::COMMENT_REACTION_CHANGED,
            json!({"entity_id": "VULN-1", "comment_id": "c-1", "reactions": {"thumbs_up": count}}),
        );
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        cache.value(&comments_key("VULN-1")).unwrap()[0]["reactions"],
        json!({}),
        "nothing applied inside the window"
    );

    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        cache.value(&comments_key("VULN-1")).unwrap()[0]["reactions"],
        json!({"thumbsUp": 5})
    );
}

#[tokio::test(start_paused = true)]
async fn test_job_progress_updates_job_status() {
    let (_h, cache, conn) = harness_with_cache().await;
    cache.seed(job_key("job-1"), json!({"id": "job-1", "percent": 0, "state": "running"}));

    conn.send_event(event_names::JOB_PROGRESS, json!({"job_id": "job-1", "percent": 60}));
    sleep(Duration::from_secs(1)).await;

    let job = cache.value(&job_key("job-1")).unwrap();
    assert_eq!(job["percent"], 60);
    assert_eq!(job["state"], "running");
}
