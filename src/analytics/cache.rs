//! Analytics result cache.
//!
//! Keys follow `analytics:{connection_id}:{endpoint}:{params_hash}` with a
//! five-minute TTL. The crawler removes every entry with the connection
//! prefix at the end of each successful sync. A dead cache backend is a
//! degradation, never an error: reads and writes fall through to direct
//! computation with a logged warning.

use crate::cache::CacheStore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

const PREFIX: &str = "analytics";
const TTL_SECONDS: u64 = 300;

#[derive(Clone)]
pub struct AnalyticsCache {
    backend: Arc<dyn CacheStore>,
}

impl AnalyticsCache {
    pub fn new(backend: Arc<dyn CacheStore>) -> Self {
        Self { backend }
    }

    /// Stable key for one endpoint invocation. `params` is canonicalized
    /// by serde_json's sorted object keys before hashing, so semantically
    /// identical requests share an entry.
    pub fn key(connection_id: &str, endpoint: &str, params: &Value) -> String {
        let canonical = params.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let hash: String = digest
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("{PREFIX}:{connection_id}:{endpoint}:{hash}")
    }

    pub async fn get(&self, connection_id: &str, endpoint: &str, params: &Value) -> Option<Value> {
        let key = Self::key(connection_id, endpoint, params);
        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!("analytics cache hit: {key}");
                    Some(value)
                }
                Err(e) => {
                    warn!("dropping undecodable cache entry {key}: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("analytics cache read failed for {key}, bypassing: {e}");
                None
            }
        }
    }

    pub async fn put(&self, connection_id: &str, endpoint: &str, params: &Value, value: &Value) {
        let key = Self::key(connection_id, endpoint, params);
        if let Err(e) = self
            .backend
            .setex(&key, TTL_SECONDS, value.to_string())
            .await
        {
            warn!("analytics cache write failed for {key}: {e}");
        }
    }

    /// Remove every cached entry for a connection. Called by the crawler
    /// after each successful sync.
    pub async fn invalidate(&self, connection_id: &str) {
        let pattern = format!("{PREFIX}:{connection_id}:*");
        let keys = match self.backend.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("analytics cache invalidation scan failed for {pattern}: {e}");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        match self.backend.del(&keys).await {
            Ok(removed) => debug!("invalidated {removed} analytics entries for {connection_id}"),
            Err(e) => warn!("analytics cache invalidation failed for {connection_id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use serde_json::json;

    fn cache() -> AnalyticsCache {
        AnalyticsCache::new(Arc::new(MemCache::new()))
    }

    #[test]
    fn key_is_stable_across_param_order() {
        let a = AnalyticsCache::key("c1", "summary", &json!({"a": 1, "b": 2}));
        let b = AnalyticsCache::key("c1", "summary", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("analytics:c1:summary:"));

        let other = AnalyticsCache::key("c1", "summary", &json!({"a": 1, "b": 3}));
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = cache();
        let params = json!({"date_from": "2024-01-01"});
        assert!(cache.get("c1", "summary", &params).await.is_none());

        cache
            .put("c1", "summary", &params, &json!({"total_count": 10}))
            .await;
        let hit = cache.get("c1", "summary", &params).await.unwrap();
        assert_eq!(hit["total_count"], 10);
    }

    #[tokio::test]
    async fn invalidate_removes_only_that_connection() {
        let cache = cache();
        let params = json!({});
        cache.put("conn_A", "summary", &params, &json!(1)).await;
        cache.put("conn_A", "top", &params, &json!(2)).await;
        cache.put("conn_B", "summary", &params, &json!(3)).await;

        cache.invalidate("conn_A").await;

        assert!(cache.get("conn_A", "summary", &params).await.is_none());
        assert!(cache.get("conn_A", "top", &params).await.is_none());
        assert_eq!(cache.get("conn_B", "summary", &params).await, Some(json!(3)));
    }

    #[tokio::test]
    async fn backend_failure_degrades_silently() {
        struct DeadCache;

        #[async_trait::async_trait]
        impl CacheStore for DeadCache {
            async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
                anyhow::bail!("connection refused")
            }
            async fn setex(&self, _k: &str, _t: u64, _v: String) -> anyhow::Result<()> {
                anyhow::bail!("connection refused")
            }
            async fn keys(&self, _p: &str) -> anyhow::Result<Vec<String>> {
                anyhow::bail!("connection refused")
            }
            async fn del(&self, _k: &[String]) -> anyhow::Result<u64> {
                anyhow::bail!("connection refused")
            }
            async fn publish(&self, _c: &str, _p: String) -> anyhow::Result<()> {
                anyhow::bail!("connection refused")
            }
            async fn subscribe(
                &self,
                _c: &str,
            ) -> anyhow::Result<tokio::sync::broadcast::Receiver<String>> {
                anyhow::bail!("connection refused")
            }
        }

        let cache = AnalyticsCache::new(Arc::new(DeadCache));
        let params = json!({});
        // None of these may panic or propagate.
        assert!(cache.get("c1", "summary", &params).await.is_none());
        cache.put("c1", "summary", &params, &json!(1)).await;
        cache.invalidate("c1").await;
    }
}
