//! # DripKit Fetch
//!
//! HTTP request/response model and network backends for the DripKit offline
//! cache engine.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests
//! 2. **Pluggable backends**: Real HTTP and in-memory test transports behind one trait
//! 3. **Cacheability signals**: Request mode and response kind carried on every exchange

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod backend;

pub use backend::{BackendConfig, HttpBackend, NetworkBackend};

/// Errors that can occur while fetching.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network offline: {0}")]
    Offline(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a request participates in navigation and cross-origin policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Restricted to the requesting origin.
    SameOrigin,
    /// Cross-origin allowed, response body opaque to the caller.
    NoCors,
    /// Cross-origin with full response access.
    #[default]
    Cors,
}

/// Interaction with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Normal HTTP cache semantics.
    #[default]
    Default,
    /// Bypass intermediate caches and revalidate at the origin server.
    Reload,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            cache_mode: CacheMode::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::get(url);
        request.mode = RequestMode::Navigate;
        request
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::get(url);
        request.method = Method::POST;
        request.body = Some(body);
        request
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the HTTP cache interaction mode.
    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    /// Set timeout.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request is a top-level document load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether this request targets the same origin as `other`.
    pub fn is_same_origin(&self, other: &Url) -> bool {
        self.url.origin() == other.origin()
    }

    /// Matching key for cache lookups. Fragments never reach the server and
    /// are stripped.
    pub fn cache_key(&self) -> String {
        let mut key = self.url.clone();
        key.set_fragment(None);
        key.to_string()
    }

    /// Clone this request under a fresh id so the original can still be
    /// consumed by the caller.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.id = RequestId::new();
        copy
    }
}

/// Visibility class of a response relative to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin response, fully visible. The only kind eligible for caching.
    Basic,
    /// Cross-origin response with CORS access.
    Cors,
    /// Cross-origin response with a hidden body.
    Opaque,
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<Mime>,
    pub kind: ResponseKind,
    /// Set when this response was served from a cache instance.
    pub from_cache: bool,
    body: Bytes,
}

impl Response {
    /// Create a response with an in-memory body.
    pub fn new(
        request_id: RequestId,
        url: Url,
        status: StatusCode,
        kind: ResponseKind,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id,
            url,
            status,
            headers: HeaderMap::new(),
            content_type: None,
            kind,
            from_cache: false,
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: Mime) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get the body as bytes.
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, FetchError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| FetchError::Backend(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://localdrip.test/home"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("text/html"),
            )
            .with_timeout(Duration::from_secs(10));

        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert_eq!(request.cache_mode, CacheMode::Default);
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_navigate_sets_mode() {
        let request = Request::navigate(url("https://localdrip.test/"));
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);

        let sub = Request::get(url("https://localdrip.test/icon.png"));
        assert!(!sub.is_navigation());
    }

    #[test]
    fn test_same_origin() {
        let request = Request::get(url("https://localdrip.test/menu"));
        assert!(request.is_same_origin(&url("https://localdrip.test/")));
        assert!(!request.is_same_origin(&url("https://cdn.example.com/")));
        assert!(!request.is_same_origin(&url("http://localdrip.test/")));
    }

    #[test]
    fn test_cache_key_strips_fragment() {
        let request = Request::get(url("https://localdrip.test/home#menu"));
        assert_eq!(request.cache_key(), "https://localdrip.test/home");

        let with_query = Request::get(url("https://localdrip.test/home?tab=1#x"));
        assert_eq!(with_query.cache_key(), "https://localdrip.test/home?tab=1");
    }

    #[test]
    fn test_duplicate_gets_fresh_id() {
        let request = Request::navigate(url("https://localdrip.test/"))
            .with_cache_mode(CacheMode::Reload);
        let copy = request.duplicate();

        assert_ne!(copy.id, request.id);
        assert_eq!(copy.url, request.url);
        assert_eq!(copy.mode, request.mode);
        assert_eq!(copy.cache_mode, request.cache_mode);
    }

    #[test]
    fn test_response_accessors() {
        let response = Response::new(
            RequestId::new(),
            url("https://localdrip.test/manifest.json"),
            StatusCode::OK,
            ResponseKind::Basic,
            r#"{"name":"LocalDrip"}"#,
        )
        .with_content_type(mime::APPLICATION_JSON);

        assert!(response.ok());
        assert!(!response.from_cache);
        assert_eq!(response.body_len(), 20);
        assert_eq!(response.text().unwrap(), r#"{"name":"LocalDrip"}"#);

        #[derive(Deserialize)]
        struct Manifest {
            name: String,
        }
        let manifest: Manifest = response.json().unwrap();
        assert_eq!(manifest.name, "LocalDrip");
    }

    #[test]
    fn test_non_success_response_not_ok() {
        let response = Response::new(
            RequestId::new(),
            url("https://localdrip.test/missing"),
            StatusCode::NOT_FOUND,
            ResponseKind::Basic,
            "",
        );
        assert!(!response.ok());
    }
}
