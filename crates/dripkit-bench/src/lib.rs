//! # DripKit Bench
//!
//! Fixtures for the DripKit offline cache engine benchmarks.
//!
//! ## Features
//!
//! - Synthetic shell manifests of arbitrary size
//! - Routed in-memory backends serving those shells
//! - Pre-populated cache instances for hit-path measurements

use bytes::Bytes;
use http::StatusCode;
use url::Url;

use dripkit_cache::{Cache, CacheStorage};
use dripkit_fetch::{Request, Response, ResponseKind};
use dripkit_sw::ShellManifest;
use dripkit_test::MemoryBackend;

/// Origin every fixture URL lives under.
pub const ORIGIN: &str = "https://localdrip.test";

/// A manifest of `entries` paths: the shell root plus synthetic assets.
pub fn shell_manifest(tag: &str, entries: usize) -> ShellManifest {
    let urls = (0..entries).map(|i| {
        if i == 0 {
            "/".to_string()
        } else {
            format!("/assets/chunk-{i}.css")
        }
    });
    ShellManifest::new(tag, urls)
}

/// Route the worker script and every manifest entry on the backend.
pub async fn route_shell(backend: &MemoryBackend, manifest: &ShellManifest) {
    backend.route_ok(&format!("{ORIGIN}/sw.js"), "// bench worker").await;
    for path in &manifest.urls {
        backend
            .route_ok(&format!("{ORIGIN}{path}"), body_for(path))
            .await;
    }
}

/// A cache pre-populated with `entries` synthetic asset responses.
pub async fn populated_cache(storage: &CacheStorage, name: &str, entries: usize) -> Cache {
    let cache = storage.open(name).await;
    for i in 0..entries {
        let path = format!("/assets/chunk-{i}.css");
        let url = Url::parse(&format!("{ORIGIN}{path}")).expect("fixture URL");
        let request = Request::get(url.clone());
        let response = Response::new(
            request.id,
            url,
            StatusCode::OK,
            ResponseKind::Basic,
            body_for(&path),
        );
        cache.put(&request, &response).await.expect("fixture put");
    }
    cache
}

/// Deterministic body sized like a small asset.
fn body_for(path: &str) -> Bytes {
    let mut body = String::with_capacity(512);
    while body.len() < 480 {
        body.push_str(path);
        body.push('\n');
    }
    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dripkit_fetch::NetworkBackend;

    #[test]
    fn test_shell_manifest_shape() {
        let manifest = shell_manifest("bench-v1", 4);
        assert_eq!(manifest.tag, "bench-v1");
        assert_eq!(manifest.urls.len(), 4);
        assert_eq!(manifest.urls[0], "/");
        assert!(manifest.urls[3].starts_with("/assets/"));
    }

    #[tokio::test]
    async fn test_route_shell_serves_entries() {
        let backend = MemoryBackend::new();
        let manifest = shell_manifest("bench-v1", 3);
        route_shell(&backend, &manifest).await;

        let url = Url::parse(&format!("{ORIGIN}/assets/chunk-2.css")).unwrap();
        let response = backend.fetch(&Request::get(url)).await.unwrap();
        assert!(response.ok());
    }

    #[tokio::test]
    async fn test_populated_cache_len() {
        let storage = CacheStorage::new();
        let cache = populated_cache(&storage, "bench-v1", 32).await;
        assert_eq!(cache.len().await, 32);
    }
}
