//! Core types for the cache store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::{Method, Request, Response};

/// Identity of a cached request: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: Url,
}

impl RequestKey {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(request.method, request.url.clone())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response together with when it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Served from the current cache store
  Cache,
  /// Fetched from the network
  Network,
  /// Network failed; serving the cached shell page instead
  OfflineFallback,
}
