//! Performance caches for computed or fetched results.
//!
//! Each purpose lives under its own namespace with its own TTL. Values are
//! wrapped in a [`CacheEntry`] so the stored document carries its own expiry;
//! a read past `expires_at` deletes the entry and reports a miss even if the
//! backing key is still alive.
//!
//! Store failures never reach callers: reads report a miss and writes are
//! dropped, both with a warning, so callers fall back to recomputing.

use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::config::PerformanceTtls;
use crate::error::Result;

/// Namespace for conversation-engine responses.
pub const AGENT_RESPONSE_PREFIX: &str = "agent_response";
/// Namespace for item information.
pub const PRODUCT_INFO_PREFIX: &str = "product_info";
/// Namespace for search results.
pub const SEARCH_RESULT_PREFIX: &str = "search_result";
/// Namespace for embedding vectors.
pub const EMBEDDING_PREFIX: &str = "embedding";

/// SHA-256 hex digest of the concatenated parts.
///
/// Used to derive stable cache keys from request content.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// A cached conversation-engine response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response_text: String,
    pub agent_type: String,
    pub confidence: f64,
    /// Seconds the engine spent producing the response.
    pub processing_time: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Entry counts per performance namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub agent_responses: usize,
    pub product_info: usize,
    pub search_results: usize,
    pub embeddings: usize,
}

impl PerformanceStats {
    /// Total entries across namespaces.
    pub fn total(&self) -> usize {
        self.agent_responses + self.product_info + self.search_results + self.embeddings
    }
}

/// One namespace of typed, TTL-bound entries.
#[derive(Clone)]
pub struct TtlCache<V> {
    store: CacheStore,
    namespace: &'static str,
    ttl: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> TtlCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Create a namespace view over `store`.
    pub fn new(store: CacheStore, namespace: &'static str, ttl: Duration) -> Self {
        Self {
            store,
            namespace,
            ttl,
            _value: PhantomData,
        }
    }

    /// Lifetime applied to new entries.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(&self, id: &str) -> String {
        CacheStore::generate_key(self.namespace, id)
    }

    /// Store `value` under `id`.
    pub async fn put(&self, id: &str, value: V) -> Result<()> {
        let key = self.key(id);
        let entry = CacheEntry::new(key.clone(), value, self.ttl);
        self.store.set_value(&key, &entry, self.ttl).await?;
        trace!(key = %key, "Cached entry");
        Ok(())
    }

    /// Load the value under `id` if it exists and has not expired.
    pub async fn get(&self, id: &str) -> Result<Option<V>> {
        let key = self.key(id);
        let Some(entry) = self.store.get_value::<CacheEntry<V>>(&key).await? else {
            return Ok(None);
        };

        if entry.is_expired() {
            debug!(key = %key, "Dropping entry past its expiry");
            self.store.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Remove the entry under `id`. Returns whether it existed.
    pub async fn invalidate(&self, id: &str) -> Result<bool> {
        self.store.delete(&self.key(id)).await
    }

    /// Number of live entries in this namespace.
    pub async fn len(&self) -> Result<usize> {
        self.store.count_prefix(self.namespace).await
    }

    /// Whether this namespace holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Write that logs and drops failures.
async fn put_or_log<V>(cache: &TtlCache<V>, id: &str, value: V)
where
    V: Serialize + DeserializeOwned,
{
    if let Err(e) = cache.put(id, value).await {
        warn!(namespace = cache.namespace, id = %id, error = %e, "Cache write failed, dropping entry");
    }
}

/// Lookup that degrades every failure into a miss.
async fn get_or_miss<V>(cache: &TtlCache<V>, id: &str) -> Option<V>
where
    V: Serialize + DeserializeOwned,
{
    match cache.get(id).await {
        Ok(value) => value,
        Err(e) => {
            warn!(namespace = cache.namespace, id = %id, error = %e, "Cache read failed, treating as miss");
            None
        }
    }
}

/// Response, item, search and embedding caches.
#[derive(Clone)]
pub struct PerformanceCache {
    agent_responses: TtlCache<CachedResponse>,
    product_info: TtlCache<Value>,
    search_results: TtlCache<Vec<Value>>,
    embeddings: TtlCache<Vec<f32>>,
}

impl PerformanceCache {
    /// Create the caches with the given TTLs.
    pub fn new(store: CacheStore, ttls: &PerformanceTtls) -> Self {
        Self {
            agent_responses: TtlCache::new(
                store.clone(),
                AGENT_RESPONSE_PREFIX,
                ttls.agent_response,
            ),
            product_info: TtlCache::new(store.clone(), PRODUCT_INFO_PREFIX, ttls.product_info),
            search_results: TtlCache::new(
                store.clone(),
                SEARCH_RESULT_PREFIX,
                ttls.search_result,
            ),
            embeddings: TtlCache::new(store, EMBEDDING_PREFIX, ttls.embedding),
        }
    }

    /// Cache an engine response for `message_hash`.
    pub async fn cache_agent_response(&self, message_hash: &str, response: CachedResponse) {
        put_or_log(&self.agent_responses, message_hash, response).await
    }

    /// Cached engine response for `message_hash`, if any.
    pub async fn get_cached_agent_response(&self, message_hash: &str) -> Option<CachedResponse> {
        get_or_miss(&self.agent_responses, message_hash).await
    }

    /// Cache item information.
    pub async fn cache_product_info(&self, product_id: &str, info: Value) {
        put_or_log(&self.product_info, product_id, info).await
    }

    /// Cached item information, if any.
    pub async fn get_cached_product_info(&self, product_id: &str) -> Option<Value> {
        get_or_miss(&self.product_info, product_id).await
    }

    /// Drop cached information for an item. Returns whether an entry existed.
    pub async fn invalidate_product_cache(&self, product_id: &str) -> bool {
        match self.product_info.invalidate(product_id).await {
            Ok(existed) => {
                if existed {
                    debug!(product_id = %product_id, "Invalidated product info");
                }
                existed
            }
            Err(e) => {
                warn!(product_id = %product_id, error = %e, "Failed to invalidate product info");
                false
            }
        }
    }

    /// Cache search results for `query_hash`.
    pub async fn cache_search_result(&self, query_hash: &str, results: Vec<Value>) {
        put_or_log(&self.search_results, query_hash, results).await
    }

    /// Cached search results for `query_hash`, if any.
    pub async fn get_cached_search_result(&self, query_hash: &str) -> Option<Vec<Value>> {
        get_or_miss(&self.search_results, query_hash).await
    }

    /// Cache an embedding for `text_hash`.
    pub async fn cache_embedding(&self, text_hash: &str, embedding: Vec<f32>) {
        put_or_log(&self.embeddings, text_hash, embedding).await
    }

    /// Cached embedding for `text_hash`, if any.
    pub async fn get_cached_embedding(&self, text_hash: &str) -> Option<Vec<f32>> {
        get_or_miss(&self.embeddings, text_hash).await
    }

    /// Entry counts per namespace.
    pub async fn stats(&self) -> Result<PerformanceStats> {
        Ok(PerformanceStats {
            agent_responses: self.agent_responses.len().await?,
            product_info: self.product_info.len().await?,
            search_results: self.search_results.len().await?,
            embeddings: self.embeddings.len().await?,
        })
    }

    /// Liveness probe used by health checks.
    pub async fn probe(&self) -> bool {
        self.product_info.get("__health_probe__").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn create_cache() -> (Arc<MemoryStore>, PerformanceCache) {
        let backend = Arc::new(MemoryStore::new());
        let cache = PerformanceCache::new(
            CacheStore::new(backend.clone()),
            &PerformanceTtls::default(),
        );
        (backend, cache)
    }

    fn response() -> CachedResponse {
        CachedResponse {
            response_text: "We have three in stock.".to_string(),
            agent_type: "inventory".to_string(),
            confidence: 0.92,
            processing_time: 1.25,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(&["hello", "world"]);
        assert_eq!(a, content_hash(&["helloworld"]));
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(&["hello"]));
        assert_eq!(
            content_hash(&[""]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_agent_response_round_trip() {
        let (_, cache) = create_cache();
        let hash = content_hash(&["how many?"]);

        cache.cache_agent_response(&hash, response()).await;
        assert_eq!(cache.get_cached_agent_response(&hash).await, Some(response()));
        assert!(cache.get_cached_agent_response("other").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_product_info_expires_and_invalidates() {
        let (_, cache) = create_cache();
        cache
            .cache_product_info("p1", json!({"name": "Lamp", "price": 19.5}))
            .await;

        assert_eq!(
            cache.get_cached_product_info("p1").await,
            Some(json!({"name": "Lamp", "price": 19.5}))
        );
        assert!(cache.invalidate_product_cache("p1").await);
        assert!(!cache.invalidate_product_cache("p1").await);
        assert!(cache.get_cached_product_info("p1").await.is_none());

        cache.cache_product_info("p2", json!({})).await;
        tokio::time::advance(Duration::from_secs(30 * 60 + 1)).await;
        assert!(cache.get_cached_product_info("p2").await.is_none());
    }

    #[tokio::test]
    async fn test_entry_past_expiry_is_deleted_on_read() {
        let (backend, cache) = create_cache();

        // Backing key still alive, but the document says it expired.
        let mut entry = CacheEntry::new("search_result:q", vec![json!(1)], Duration::from_secs(60));
        entry.expires_at = entry.created_at - chrono::Duration::seconds(1);
        backend
            .set_ex(
                "search_result:q",
                &CacheStore::serialize(&entry).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(cache.get_cached_search_result("q").await.is_none());
        assert!(backend.get("search_result:q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_and_embedding() {
        let (_, cache) = create_cache();
        cache
            .cache_search_result("q1", vec![json!({"id": 1}), json!({"id": 2})])
            .await;
        cache.cache_embedding("t1", vec![0.5, -0.25, 1.0]).await;

        assert_eq!(cache.get_cached_search_result("q1").await.unwrap().len(), 2);
        assert_eq!(
            cache.get_cached_embedding("t1").await,
            Some(vec![0.5, -0.25, 1.0])
        );
    }

    #[tokio::test]
    async fn test_stats_counts_each_namespace() {
        let (_, cache) = create_cache();
        cache.cache_agent_response("a", response()).await;
        cache.cache_product_info("p", json!(null)).await;
        cache.cache_product_info("q", json!(1)).await;
        cache.cache_embedding("e", vec![]).await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(
            stats,
            PerformanceStats {
                agent_responses: 1,
                product_info: 2,
                search_results: 0,
                embeddings: 1,
            }
        );
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn test_failures_degrade_to_miss() {
        let (backend, cache) = create_cache();
        backend.set("embedding:bad", "not json").await.unwrap();
        assert!(cache.get_cached_embedding("bad").await.is_none());

        backend.set_offline(true);
        assert!(cache.get_cached_agent_response("a").await.is_none());
        cache.cache_product_info("p", json!(1)).await;
        assert!(!cache.invalidate_product_cache("p").await);
        assert!(!cache.probe().await);

        backend.set_offline(false);
        assert!(cache.get_cached_product_info("p").await.is_none());
    }
}
