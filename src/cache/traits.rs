//! Core types for the response cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::Response;

/// Canonical identity of a cacheable request: GET plus the absolute URL.
///
/// Fragments never reach the network, so they are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  url: Url,
}

impl RequestKey {
  pub fn new(mut url: Url) -> Self {
    url.set_fragment(None);
    Self { url }
  }

  /// Parse a stored identity back into a key.
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid cache key '{}': {}", url, e))?;
    Ok(Self::new(url))
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "GET {}", self.url)
  }
}

/// A stored response. Only successful (2xx) responses can be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  status: u16,
  status_text: String,
  headers: Vec<(String, String)>,
  body: Vec<u8>,
  cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Copy a live response for storage; `None` unless it is a 2xx.
  pub fn from_response(response: &Response) -> Option<Self> {
    if !response.is_success() {
      return None;
    }
    Some(Self {
      status: response.status,
      status_text: response.status_text.clone(),
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    })
  }

  /// A JSON document stored directly, without a network round trip.
  pub fn json<T: Serialize>(value: &T) -> Result<Self> {
    let body = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize: {}", e))?;
    Ok(Self {
      status: 200,
      status_text: "OK".to_string(),
      headers: vec![("Content-Type".to_string(), "application/json".to_string())],
      body,
      cached_at: Utc::now(),
    })
  }

  /// Rebuild an entry read from storage.
  pub fn from_parts(
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    cached_at: DateTime<Utc>,
  ) -> Result<Self> {
    if !(200..300).contains(&status) {
      return Err(eyre!("Refusing cached entry with status {}", status));
    }
    Ok(Self {
      status,
      status_text,
      headers,
      body,
      cached_at,
    })
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn status_text(&self) -> &str {
    &self.status_text
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn cached_at(&self) -> DateTime<Utc> {
    self.cached_at
  }

  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from cache without touching the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed, a cached copy was served instead.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed and nothing usable was cached.
  pub fn placeholder(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Placeholder,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network unavailable, serving cached data
  Offline,
  /// Network unavailable and no cache entry, synthetic response
  Placeholder,
}
