//! Cache layer that orchestrates caching policy with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::net::{Destination, Request, Response};

use super::storage::ResponseStore;
use super::traits::{CacheResult, CachedResponse, RequestKey};

/// Body of the synthetic 503 returned by cache-first requests
pub const CACHE_FIRST_OFFLINE_MESSAGE: &str = "Offline - محتوا در دسترس نیست";
/// Body of the synthetic 503 returned by network-first requests
pub const NETWORK_FIRST_OFFLINE_MESSAGE: &str = "Offline - اطلاعات در دسترس نیست";

/// Cache layer that applies a caching policy around a network fetch.
///
/// Successful network responses are copied into the dynamic partition; lookups
/// consult every partition. Network and storage failures never reach the caller:
/// they end in a cached copy or a synthetic offline response.
pub struct CacheLayer {
  storage: Arc<dyn ResponseStore>,
  /// Partition receiving runtime-fetched responses
  dynamic_partition: String,
  /// Cached page served to document requests when offline
  offline_document: RequestKey,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(
    storage: Arc<dyn ResponseStore>,
    dynamic_partition: impl Into<String>,
    offline_document: RequestKey,
  ) -> Self {
    Self {
      storage,
      dynamic_partition: dynamic_partition.into(),
      offline_document,
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Cache hit - return it, the network is not consulted
  /// 2. Miss - fetch, store a copy if successful, return the live response
  /// 3. Network failure - offline document for navigations, 503 otherwise
  pub async fn cache_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let key = RequestKey::new(request.url.clone());

    match self.storage.match_any(&key) {
      Ok(Some(cached)) => {
        debug!(key = %key, "Cache hit");
        let cached_at = cached.cached_at();
        return CacheResult::from_cache(cached.into_response(), cached_at);
      }
      Ok(None) => {}
      Err(e) => {
        warn!(key = %key, error = %e, "Cache lookup failed");
        return self.offline_fallback(request);
      }
    }

    match fetcher().await {
      Ok(response) => {
        self.store_copy(&key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Network fetch failed");
        self.offline_fallback(request)
      }
    }
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch - store a copy if successful (replacing any stale entry), return it
  /// 2. Network failure - any cached entry for the key
  /// 3. Nothing cached - synthetic 503
  pub async fn network_first<F, Fut>(&self, request: &Request, fetcher: F) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let key = RequestKey::new(request.url.clone());

    match fetcher().await {
      Ok(response) => {
        self.store_copy(&key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Network fetch failed, trying cache");
        match self.storage.match_any(&key) {
          Ok(Some(cached)) => {
            let cached_at = cached.cached_at();
            CacheResult::offline(cached.into_response(), cached_at)
          }
          Ok(None) => {
            CacheResult::placeholder(Response::offline_text(NETWORK_FIRST_OFFLINE_MESSAGE))
          }
          Err(e) => {
            warn!(key = %key, error = %e, "Cache lookup failed");
            CacheResult::placeholder(Response::offline_text(NETWORK_FIRST_OFFLINE_MESSAGE))
          }
        }
      }
    }
  }

  /// Copy a successful response into the dynamic partition.
  ///
  /// The live response is returned to the caller whether or not the write succeeds.
  fn store_copy(&self, key: &RequestKey, response: &Response) {
    let Some(cached) = CachedResponse::from_response(response) else {
      debug!(key = %key, status = response.status, "Not caching unsuccessful response");
      return;
    };
    if let Err(e) = self.storage.put(&self.dynamic_partition, key, &cached) {
      warn!(key = %key, error = %e, "Failed to cache response");
    }
  }

  fn offline_fallback(&self, request: &Request) -> CacheResult<Response> {
    if request.destination == Destination::Document {
      match self.storage.match_any(&self.offline_document) {
        Ok(Some(cached)) => {
          let cached_at = cached.cached_at();
          return CacheResult::offline(cached.into_response(), cached_at);
        }
        Ok(None) => {}
        Err(e) => warn!(key = %self.offline_document, error = %e, "Offline document lookup failed"),
      }
      return CacheResult::placeholder(Response::offline_document());
    }

    CacheResult::placeholder(Response::offline_text(CACHE_FIRST_OFFLINE_MESSAGE))
  }
}
