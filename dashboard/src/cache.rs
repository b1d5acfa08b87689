use async_trait::async_trait;
use common::{Error, Result};
use dashmap::DashMap;
use glob::Pattern;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::form_urlencoded;

/// `role:endpoint:k1=v1:k2=v2` with keys sorted and values form-url-encoded.
/// Structured values are encoded as compact JSON with sorted keys.
pub fn build_cache_key(role: &str, endpoint: &str, filters: &BTreeMap<String, Value>) -> String {
    let mut parts = vec![role.to_string(), endpoint.to_string()];
    for (key, value) in filters {
        parts.push(format!("{}={}", key, encode_filter_value(value)));
    }
    parts.join(":")
}

fn encode_filter_value(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => sorted(value).to_string(),
        other => other.to_string(),
    };
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted(v))).collect();
            let mut out = Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set_ex(&self, key: &str, ttl: Duration, value: Value) -> Result<()>;
    /// Removes every key matching the glob `pattern` (`*`, `?`, `[...]`),
    /// returning how many.
    async fn invalidate(&self, pattern: &str) -> Result<usize>;
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Process-local cache; expired entries are dropped on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: Value) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let matcher = Pattern::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("Invalid cache key pattern {}: {}", pattern, e)))?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !matcher.matches(key));
        let removed = before.saturating_sub(self.entries.len());
        debug!(pattern, removed, "Invalidated cache keys");
        Ok(removed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub body: Map<String, Value>,
    pub cache_hit: bool,
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    }
}

/// Read-through: a cache hit is returned as is, a miss runs `fetch` and
/// stores its result for `ttl`. Cache backend errors degrade to a miss.
pub async fn get_or_fetch<F, Fut>(
    cache: &dyn ResponseCache,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<CachedResponse>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    match cache.get(key).await {
        Ok(Some(value)) => {
            return Ok(CachedResponse {
                body: into_object(value),
                cache_hit: true,
            });
        }
        Ok(None) => {}
        Err(err) => warn!(key, error = %err, "Cache read failed, fetching"),
    }

    let body = into_object(fetch().await?);
    if let Err(err) = cache.set_ex(key, ttl, Value::Object(body.clone())).await {
        warn!(key, error = %err, "Cache write failed");
    }
    Ok(CachedResponse {
        body,
        cache_hit: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn filters(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_cache_key_sorts_and_encodes_filters() {
        let key = build_cache_key(
            "agent",
            "assigned_loans",
            &filters(&[
                ("status_filter", json!("ALL")),
                ("date", json!("2024-01-03")),
                ("agent_id", json!("A 7")),
            ]),
        );
        assert_eq!(
            key,
            "agent:assigned_loans:agent_id=A+7:date=2024-01-03:status_filter=ALL"
        );
    }

    #[test]
    fn test_structured_values_encode_with_sorted_keys() {
        let key = build_cache_key(
            "manager",
            "branch_summary",
            &filters(&[("range", json!({"to": "b", "from": "a"})), ("limit", json!(5))]),
        );
        assert_eq!(
            key,
            "manager:branch_summary:limit=5:range=%7B%22from%22%3A%22a%22%2C%22to%22%3A%22b%22%7D"
        );
        assert_eq!(build_cache_key("hr", "performance", &BTreeMap::new()), "hr:performance");
    }

    #[tokio::test]
    async fn test_expired_entries_are_misses() {
        let cache = MemoryCache::new();
        cache.set_ex("k", Duration::ZERO, json!({"a": 1})).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());

        cache.set_ex("k", Duration::from_secs(60), json!({"a": 1})).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_ex("agent:a:x=1", ttl, json!({})).await.unwrap();
        cache.set_ex("agent:b:x=2", ttl, json!({})).await.unwrap();
        cache.set_ex("hr:performance", ttl, json!({})).await.unwrap();

        assert_eq!(cache.invalidate("agent:*").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_supports_wildcards_and_classes() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        for key in ["summary:a1", "summary:b2", "summary:c3", "hr:performance:date=1"] {
            cache.set_ex(key, ttl, json!({})).await.unwrap();
        }

        assert_eq!(cache.invalidate("summary:[ab]*").await.unwrap(), 2);
        assert!(cache.get("summary:c3").await.unwrap().is_some());
        assert_eq!(cache.invalidate("*:date=?").await.unwrap(), 1);
        assert_eq!(cache.invalidate("manager:*").await.unwrap(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_pattern_is_rejected() {
        let cache = MemoryCache::new();
        cache.set_ex("summary:a1", Duration::from_secs(60), json!({})).await.unwrap();
        let err = cache.invalidate("summary:[a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_reads_through_once() {
        let cache = MemoryCache::new();
        let calls = AtomicU32::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!([1, 2, 3]))
        };

        let first = get_or_fetch(&cache, "k", Duration::from_secs(30), fetch)
            .await
            .unwrap();
        let second = get_or_fetch(&cache, "k", Duration::from_secs(30), fetch)
            .await
            .unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.body["data"], json!([1, 2, 3]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = MemoryCache::new();
        let result = get_or_fetch(&cache, "k", Duration::from_secs(30), || async {
            Err(common::Error::Other("warehouse down".into()))
        })
        .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
