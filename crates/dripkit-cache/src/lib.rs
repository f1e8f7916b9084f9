//! # DripKit Cache
//!
//! Named request/response cache instances for the DripKit offline cache
//! engine.
//!
//! ## Features
//!
//! - **Cache instances**: named collections of request/response pairs
//! - **Cache storage**: origin-scoped registry, `open()`, `delete()`, `keys()`
//! - **Platform matching rules**: GET-only lookup keyed by fragment-stripped URL
//! - **Storage limits**: optional per-cache entry budget surfaced as quota errors
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache ("localdrip-v1", "localdrip-v2", ...)
//!             └── URL key → CacheEntry (status, headers, body)
//! ```
//!
//! A `Cache` handle is cheap to clone and shares its entries; every
//! operation locks a single entry map, so individual get/put/delete calls
//! are atomic while no cross-entry transaction exists.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use dripkit_fetch::{Request, RequestId, Response, ResponseKind};

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Response cannot be cached: {0}")]
    Uncacheable(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
}

// ==================== Limits ====================

/// Storage budget for a cache instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Maximum number of entries per cache. `None` means unlimited.
    pub max_entries: Option<usize>,
}

impl CacheLimits {
    /// Cap the number of entries.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
        }
    }
}

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: Method,

    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response content type.
    pub content_type: Option<Mime>,

    /// Response visibility class.
    pub kind: ResponseKind,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under the request's URL.
    fn from_exchange(request: &Request, response: &Response) -> Self {
        Self {
            url: request.url.clone(),
            method: request.method.clone(),
            status: response.status,
            headers: response.headers.clone(),
            content_type: response.content_type.clone(),
            kind: response.kind,
            body: response.bytes(),
            cached_at: now_ms(),
        }
    }

    /// Rebuild a servable response for a new request.
    fn to_response(&self, request_id: RequestId) -> Response {
        let mut response = Response::new(
            request_id,
            self.url.clone(),
            self.status,
            self.kind,
            self.body.clone(),
        );
        response.headers = self.headers.clone();
        response.content_type = self.content_type.clone();
        response.from_cache = true;
        response
    }
}

// ==================== Cache ====================

/// A named cache instance.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    limits: CacheLimits,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl Cache {
    fn new(name: &str, limits: CacheLimits) -> Self {
        Self {
            name: name.to_string(),
            limits,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Only GET requests participate in cache matching.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        let entries = self.entries.read().await;
        entries
            .get(&request.cache_key())
            .map(|entry| entry.to_response(request.id))
    }

    /// Match by URL alone.
    pub async fn match_url(&self, url: &Url) -> Option<Response> {
        let mut key = url.clone();
        key.set_fragment(None);
        let entries = self.entries.read().await;
        entries
            .get(key.as_str())
            .map(|entry| entry.to_response(RequestId::new()))
    }

    /// Store a response under the request's URL. The stored entry is a
    /// duplicate; the caller keeps the original response.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        if request.method != Method::GET {
            return Err(CacheError::Uncacheable(format!(
                "{} request: {}",
                request.method, request.url
            )));
        }
        if response.status == StatusCode::PARTIAL_CONTENT {
            return Err(CacheError::Uncacheable(format!(
                "partial response: {}",
                request.url
            )));
        }

        let key = request.cache_key();
        let mut entries = self.entries.write().await;
        if let Some(max_entries) = self.limits.max_entries {
            if !entries.contains_key(&key) && entries.len() >= max_entries {
                return Err(CacheError::QuotaExceeded(format!(
                    "cache {} is full ({} entries)",
                    self.name, max_entries
                )));
            }
        }

        trace!(cache = %self.name, key = %key, status = %response.status, "Cache put");
        entries.insert(key, CacheEntry::from_exchange(request, response));
        Ok(())
    }

    /// Delete the entry for a request.
    pub async fn delete(&self, request: &Request) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(&request.cache_key()).is_some()
    }

    /// Get all keys (URLs), sorted.
    pub async fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Origin-scoped registry of named caches.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    limits: CacheLimits,
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage whose caches enforce the given limits.
    pub fn with_limits(limits: CacheLimits) -> Self {
        Self {
            limits,
            caches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a cache, creating it if it does not exist. The returned handle
    /// shares entries with every other handle for the same name.
    pub async fn open(&self, name: &str) -> Cache {
        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(cache = %name, "Cache created");
                Cache::new(name, self.limits.clone())
            })
            .clone()
    }

    /// Check if a cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache and all of its entries.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.caches.write().await.remove(name).is_some();
        if removed {
            debug!(cache = %name, "Cache deleted");
        }
        removed
    }

    /// Get all cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let caches = self.caches.read().await;
        let mut keys: Vec<String> = caches.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Match a request across all caches.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches: Vec<Cache> = self.caches.read().await.values().cloned().collect();
        for cache in caches {
            if let Some(response) = cache.match_request(request).await {
                return Some(response);
            }
        }
        None
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn response_for(request: &Request, body: &str) -> Response {
        Response::new(
            request.id,
            request.url.clone(),
            StatusCode::OK,
            ResponseKind::Basic,
            body.to_string(),
        )
    }

    #[tokio::test]
    async fn test_put_then_match() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        let req = request("https://localdrip.test/home");
        cache.put(&req, &response_for(&req, "home page")).await.unwrap();

        let hit = cache.match_request(&request("https://localdrip.test/home")).await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.text().unwrap(), "home page");

        assert!(cache.match_request(&request("https://localdrip.test/other")).await.is_none());
    }

    #[tokio::test]
    async fn test_match_is_get_only() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        let get = request("https://localdrip.test/order");
        cache.put(&get, &response_for(&get, "order form")).await.unwrap();

        let post = Request::post(
            Url::parse("https://localdrip.test/order").unwrap(),
            Bytes::from_static(b"size=large"),
        );
        assert!(cache.match_request(&post).await.is_none());

        let put_err = cache.put(&post, &response_for(&get, "x")).await.unwrap_err();
        assert!(matches!(put_err, CacheError::Uncacheable(_)));
    }

    #[tokio::test]
    async fn test_match_ignores_fragment() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        let req = request("https://localdrip.test/menu");
        cache.put(&req, &response_for(&req, "menu")).await.unwrap();

        let hit = cache.match_request(&request("https://localdrip.test/menu#espresso")).await;
        assert!(hit.is_some());

        let miss = cache.match_request(&request("https://localdrip.test/menu?day=2")).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_partial_responses_rejected() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        let req = request("https://localdrip.test/track.mp3");
        let mut partial = response_for(&req, "bytes 0-99");
        partial.status = StatusCode::PARTIAL_CONTENT;

        let err = cache.put(&req, &partial).await.unwrap_err();
        assert!(matches!(err, CacheError::Uncacheable(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_quota_limit() {
        let storage = CacheStorage::with_limits(CacheLimits::with_max_entries(2));
        let cache = storage.open("localdrip-v1").await;

        let a = request("https://localdrip.test/a");
        let b = request("https://localdrip.test/b");
        let c = request("https://localdrip.test/c");
        cache.put(&a, &response_for(&a, "a")).await.unwrap();
        cache.put(&b, &response_for(&b, "b")).await.unwrap();

        let err = cache.put(&c, &response_for(&c, "c")).await.unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded(_)));

        // Overwriting an existing key stays within budget.
        cache.put(&a, &response_for(&a, "a2")).await.unwrap();
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        let req = request("https://localdrip.test/icon.png");
        cache.put(&req, &response_for(&req, "png")).await.unwrap();

        assert!(cache.delete(&req).await);
        assert!(!cache.delete(&req).await);
        assert!(cache.match_request(&req).await.is_none());
    }

    #[tokio::test]
    async fn test_open_returns_shared_handle() {
        let storage = CacheStorage::new();
        let first = storage.open("localdrip-v1").await;
        let second = storage.open("localdrip-v1").await;

        let req = request("https://localdrip.test/shared");
        first.put(&req, &response_for(&req, "shared")).await.unwrap();

        assert!(second.match_request(&req).await.is_some());
        assert_eq!(storage.keys().await, vec!["localdrip-v1"]);
    }

    #[tokio::test]
    async fn test_storage_delete_drops_entries() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;
        let req = request("https://localdrip.test/home");
        cache.put(&req, &response_for(&req, "home")).await.unwrap();

        assert!(storage.delete("localdrip-v1").await);
        assert!(!storage.has("localdrip-v1").await);
        assert!(storage.match_request(&req).await.is_none());
        assert!(!storage.delete("localdrip-v1").await);
    }

    #[tokio::test]
    async fn test_storage_match_searches_all_caches() {
        let storage = CacheStorage::new();
        let v1 = storage.open("localdrip-v1").await;
        let v2 = storage.open("localdrip-v2").await;

        let old = request("https://localdrip.test/old");
        let new = request("https://localdrip.test/new");
        v1.put(&old, &response_for(&old, "old")).await.unwrap();
        v2.put(&new, &response_for(&new, "new")).await.unwrap();

        assert!(storage.match_request(&old).await.is_some());
        assert!(storage.match_request(&new).await.is_some());
        assert_eq!(storage.keys().await, vec!["localdrip-v1", "localdrip-v2"]);
    }

    #[tokio::test]
    async fn test_cache_keys_sorted() {
        let storage = CacheStorage::new();
        let cache = storage.open("localdrip-v1").await;

        for path in ["/c", "/a", "/b"] {
            let req = request(&format!("https://localdrip.test{path}"));
            cache.put(&req, &response_for(&req, path)).await.unwrap();
        }

        assert_eq!(
            cache.keys().await,
            vec![
                "https://localdrip.test/a",
                "https://localdrip.test/b",
                "https://localdrip.test/c",
            ]
        );
    }
}
