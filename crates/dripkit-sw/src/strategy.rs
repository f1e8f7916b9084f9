//! Cache-first response strategy.
//!
//! A hit is served as-is with no revalidation; refreshes only ever come
//! from a new worker version's install. Only successful basic responses
//! are written back, and a failed write never withholds the response.

use dripkit_cache::Cache;
use dripkit_fetch::{NetworkBackend, Request, Response, ResponseKind};
use tracing::{debug, warn};
use url::Url;

use crate::WorkerError;

pub(crate) async fn respond(
    cache: &Cache,
    backend: &dyn NetworkBackend,
    request: &Request,
    fallback: &Url,
) -> Result<Response, WorkerError> {
    if let Some(hit) = cache.match_request(request).await {
        debug!(url = %request.url, cache = %cache.name(), "Serving from cache");
        return Ok(hit);
    }

    // The caller may still consume the original request; the network gets
    // a duplicate.
    let relay = request.duplicate();
    match backend.fetch(&relay).await {
        Ok(response) => {
            if response.ok() && response.kind == ResponseKind::Basic {
                if let Err(err) = cache.put(request, &response).await {
                    warn!(url = %request.url, error = %err, "Failed to cache response");
                }
            }
            debug!(url = %request.url, status = %response.status, "Serving from network");
            Ok(response)
        }
        Err(err) if request.is_navigation() => {
            warn!(url = %request.url, error = %err, "Navigation fetch failed, serving shell fallback");
            match cache.match_url(fallback).await {
                Some(shell) => Ok(shell),
                None => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}
