//! # DripKit Test
//!
//! Deterministic network backend for DripKit engine tests.
//!
//! ## Features
//!
//! - **Route table**: URL → canned response, no sockets involved
//! - **Offline switch**: every fetch fails until flipped back
//! - **Request counters**: per-URL counts for asserting cache-first behavior
//! - **Request log**: every received request, for asserting modes and headers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::StatusCode;
use mime::Mime;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use dripkit_fetch::{FetchError, NetworkBackend, Request, Response, ResponseKind};

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    body: Bytes,
    kind: ResponseKind,
    content_type: Option<Mime>,
}

/// In-memory network backend backed by a route table.
///
/// Clones share the table, the counters, and the offline switch.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    routes: Arc<RwLock<HashMap<String, Route>>>,
    hits: Arc<RwLock<HashMap<String, usize>>>,
    log: Arc<RwLock<Vec<Request>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a URL to a canned same-origin response.
    pub async fn route(&self, url: &str, status: StatusCode, body: impl Into<Bytes>) {
        self.route_with_kind(url, status, body, ResponseKind::Basic)
            .await;
    }

    /// Route a URL to a 200 response with the given body.
    pub async fn route_ok(&self, url: &str, body: impl Into<Bytes>) {
        self.route(url, StatusCode::OK, body).await;
    }

    /// Route a URL with an explicit response kind.
    pub async fn route_with_kind(
        &self,
        url: &str,
        status: StatusCode,
        body: impl Into<Bytes>,
        kind: ResponseKind,
    ) {
        let mut routes = self.routes.write().await;
        routes.insert(
            normalize(url),
            Route {
                status,
                body: body.into(),
                kind,
                content_type: None,
            },
        );
    }

    /// Route a URL to serve an existing response's status, kind, and body.
    pub async fn route_response(&self, url: &str, response: &Response) {
        let mut routes = self.routes.write().await;
        routes.insert(
            normalize(url),
            Route {
                status: response.status,
                body: response.bytes(),
                kind: response.kind,
                content_type: response.content_type.clone(),
            },
        );
    }

    /// Remove a route. Subsequent fetches of the URL answer 404.
    pub async fn unroute(&self, url: &str) -> bool {
        self.routes.write().await.remove(&normalize(url)).is_some()
    }

    /// Toggle offline mode. While offline every fetch fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Whether the backend is offline.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Number of fetches issued for a URL, offline attempts included.
    pub async fn request_count(&self, url: &str) -> usize {
        self.hits
            .read()
            .await
            .get(&normalize(url))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of fetches issued.
    pub async fn total_requests(&self) -> usize {
        self.hits.read().await.values().sum()
    }

    /// Every request received so far, in arrival order. Offline attempts
    /// are logged too.
    pub async fn requests(&self) -> Vec<Request> {
        self.log.read().await.clone()
    }

    /// Clear the request counters and the request log.
    pub async fn reset_counts(&self) {
        self.hits.write().await.clear();
        self.log.write().await.clear();
    }
}

#[async_trait]
impl NetworkBackend for MemoryBackend {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let key = request.cache_key();

        {
            let mut hits = self.hits.write().await;
            *hits.entry(key.clone()).or_insert(0) += 1;
        }
        self.log.write().await.push(request.clone());

        if self.is_offline() {
            trace!(url = %request.url, "Offline, failing fetch");
            return Err(FetchError::Offline(request.url.to_string()));
        }

        let routes = self.routes.read().await;
        match routes.get(&key) {
            Some(route) => {
                trace!(url = %request.url, status = %route.status, "Serving routed response");
                let mut response = Response::new(
                    request.id,
                    request.url.clone(),
                    route.status,
                    route.kind,
                    route.body.clone(),
                );
                response.content_type = route.content_type.clone();
                Ok(response)
            }
            None => {
                trace!(url = %request.url, "No route, answering 404");
                Ok(Response::new(
                    request.id,
                    request.url.clone(),
                    StatusCode::NOT_FOUND,
                    ResponseKind::Basic,
                    Bytes::new(),
                ))
            }
        }
    }
}

/// Fragment-stripped form of a URL, matching request cache keys.
fn normalize(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_routed_response() {
        let backend = MemoryBackend::new();
        backend.route_ok("https://localdrip.test/home", "home page").await;

        let response = backend.fetch(&request("https://localdrip.test/home")).await.unwrap();
        assert!(response.ok());
        assert_eq!(response.kind, ResponseKind::Basic);
        assert_eq!(response.text().unwrap(), "home page");
    }

    #[tokio::test]
    async fn test_unrouted_url_answers_404() {
        let backend = MemoryBackend::new();
        let response = backend.fetch(&request("https://localdrip.test/nope")).await.unwrap();
        assert!(!response.ok());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_fails_fetches() {
        let backend = MemoryBackend::new();
        backend.route_ok("https://localdrip.test/home", "home").await;

        backend.set_offline(true);
        let err = backend.fetch(&request("https://localdrip.test/home")).await.unwrap_err();
        assert!(matches!(err, FetchError::Offline(_)));

        backend.set_offline(false);
        assert!(backend.fetch(&request("https://localdrip.test/home")).await.is_ok());
    }

    #[tokio::test]
    async fn test_request_counters() {
        let backend = MemoryBackend::new();
        backend.route_ok("https://localdrip.test/a", "a").await;

        let req = request("https://localdrip.test/a");
        backend.fetch(&req).await.unwrap();
        backend.fetch(&req.duplicate()).await.unwrap();
        backend.fetch(&request("https://localdrip.test/b")).await.unwrap();

        assert_eq!(backend.request_count("https://localdrip.test/a").await, 2);
        assert_eq!(backend.request_count("https://localdrip.test/b").await, 1);
        assert_eq!(backend.total_requests().await, 3);

        backend.reset_counts().await;
        assert_eq!(backend.total_requests().await, 0);
        assert!(backend.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_response_replays() {
        let backend = MemoryBackend::new();
        backend.route_ok("https://localdrip.test/orig", "payload").await;
        let original = backend
            .fetch(&request("https://localdrip.test/orig"))
            .await
            .unwrap();

        backend.route_response("https://localdrip.test/copy", &original).await;
        let copy = backend
            .fetch(&request("https://localdrip.test/copy"))
            .await
            .unwrap();
        assert_eq!(copy.status, original.status);
        assert_eq!(copy.text().unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_request_log_preserves_order_and_modes() {
        use dripkit_fetch::CacheMode;

        let backend = MemoryBackend::new();
        backend.route_ok("https://localdrip.test/a", "a").await;

        backend.fetch(&request("https://localdrip.test/a")).await.unwrap();
        let reload = request("https://localdrip.test/b").with_cache_mode(CacheMode::Reload);
        backend.fetch(&reload).await.unwrap();

        let log = backend.requests().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].url.as_str(), "https://localdrip.test/a");
        assert_eq!(log[1].cache_mode, CacheMode::Reload);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        clone.route_ok("https://localdrip.test/shared", "shared").await;
        backend.set_offline(true);

        assert!(clone.is_offline());
        clone.set_offline(false);
        let response = backend.fetch(&request("https://localdrip.test/shared")).await.unwrap();
        assert!(response.ok());
    }
}
