//! Network backends behind the [`NetworkBackend`] trait.
//!
//! The engine never talks to the network directly; every fetch goes through
//! a backend so hosts can swap the real HTTP transport for a deterministic
//! one in tests.

use std::time::Duration;

use async_trait::async_trait;
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{CacheMode, FetchError, Request, RequestMode, Response, ResponseKind};

/// Transport seam for issuing requests.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// HTTP backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            user_agent: "DripKit/1.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Real HTTP transport over a shared client.
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    /// Create a new HTTP backend.
    pub fn new(config: BackendConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| FetchError::Backend(e.to_string()))?;

        info!("HttpBackend initialized");

        Ok(Self { client, config })
    }

    fn classify_error(&self, err: reqwest::Error, request: &Request) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(request.url.to_string())
        } else if err.is_connect() {
            FetchError::ConnectionFailed(format!("{}: {}", request.url, err))
        } else {
            FetchError::Backend(err.to_string())
        }
    }
}

#[async_trait]
impl NetworkBackend for HttpBackend {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        debug!(url = %request.url, method = %request.method, cache_mode = ?request.cache_mode, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        // Reload mode must reach the origin server, not an intermediate cache.
        if request.cache_mode == CacheMode::Reload {
            req_builder = req_builder
                .header("Cache-Control", "no-cache")
                .header("Pragma", "no-cache");
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.classify_error(e, request))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok());

        let kind = if url.origin() == request.url.origin() {
            ResponseKind::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseKind::Opaque
        } else {
            ResponseKind::Cors
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify_error(e, request))?;

        trace!(
            url = %url,
            status = %status,
            kind = ?kind,
            body_len = body.len(),
            "Response received"
        );

        let mut out = Response::new(request.id, url, status, kind, body);
        out.headers = headers;
        out.content_type = content_type;
        Ok(out)
    }
}
