//! Request interception: picks a caching policy per request.

use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheLayer, CacheResult};
use crate::net::{Fetcher, Request, Response};

/// How an intercepted request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Own origin and trusted CDN hosts
  CacheFirst,
  /// Every other host
  NetworkFirst,
  /// Not intercepted (non-GET)
  Passthrough,
}

pub struct FetchInterceptor {
  layer: CacheLayer,
  fetcher: Arc<dyn Fetcher>,
  origin: Url,
  trusted_hosts: BTreeSet<String>,
}

impl FetchInterceptor {
  pub fn new(
    layer: CacheLayer,
    fetcher: Arc<dyn Fetcher>,
    origin: Url,
    trusted_hosts: BTreeSet<String>,
  ) -> Self {
    Self {
      layer,
      fetcher,
      origin,
      trusted_hosts,
    }
  }

  pub fn classify(&self, request: &Request) -> Policy {
    if !request.is_get() {
      return Policy::Passthrough;
    }

    if request.url.origin() == self.origin.origin() {
      return Policy::CacheFirst;
    }

    let trusted = request
      .url
      .host_str()
      .map(|host| self.trusted_hosts.contains(&host.to_ascii_lowercase()))
      .unwrap_or(false);
    if trusted {
      Policy::CacheFirst
    } else {
      Policy::NetworkFirst
    }
  }

  /// Answer a request, or `None` when it is not intercepted.
  pub async fn intercept(&self, request: &Request) -> Option<CacheResult<Response>> {
    let fetcher = &self.fetcher;
    match self.classify(request) {
      Policy::Passthrough => None,
      Policy::CacheFirst => Some(
        self
          .layer
          .cache_first(request, || fetcher.fetch(request))
          .await,
      ),
      Policy::NetworkFirst => Some(
        self
          .layer
          .network_first(request, || fetcher.fetch(request))
          .await,
      ),
    }
  }
}
