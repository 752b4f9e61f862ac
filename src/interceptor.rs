//! Cache-first request interception with write-through population.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheSource, CacheStorage, RequestKey};
use crate::config::AgentConfig;
use crate::error::{FetchError, NetworkError};
use crate::event::WaitUntil;
use crate::net::{Network, Request, Response};

/// The answer handed back to the page, and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intercepted {
  pub response: Response,
  pub source: CacheSource,
}

impl Intercepted {
  fn new(response: Response, source: CacheSource) -> Self {
    Self { response, source }
  }
}

/// Mediates every request a controlled page issues.
pub struct FetchInterceptor {
  config: Arc<AgentConfig>,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
}

impl FetchInterceptor {
  pub fn new(
    config: Arc<AgentConfig>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Self {
    Self {
      config,
      storage,
      network,
    }
  }

  /// Answer a request from the current store, falling back to the network.
  ///
  /// 1. Cached entry: returned as-is, never revalidated
  /// 2. Network 2xx: returned; GET responses are also written to the store
  ///    from a task registered on `wait`
  /// 3. Network failure or non-2xx: navigations get the cached shell page;
  ///    anything else gets the failure
  pub async fn handle_fetch(
    &self,
    request: &Request,
    wait: &WaitUntil,
  ) -> Result<Intercepted, FetchError> {
    let key = RequestKey::from(request);

    if let Some(cached) = self.lookup(&key) {
      debug!(key = %key, "Cache hit");
      return Ok(Intercepted::new(cached, CacheSource::Cache));
    }
    debug!(key = %key, "Cache miss");

    let failure = match self.network.fetch(request).await {
      Ok(response) if response.ok() => {
        if request.method.is_cacheable() {
          self.write_through(key, response.clone(), wait);
        }
        return Ok(Intercepted::new(response, CacheSource::Network));
      }
      Ok(response) => Failure::Status(response),
      Err(e) => Failure::Transport(e),
    };

    if request.is_navigation() {
      if let Some(shell) = self.shell() {
        debug!(url = %request.url, "Serving offline shell");
        return Ok(Intercepted::new(shell, CacheSource::OfflineFallback));
      }
    }

    match failure {
      Failure::Status(response) => Ok(Intercepted::new(response, CacheSource::Network)),
      Failure::Transport(e) if request.is_navigation() => {
        debug!("No cached shell to fall back to: {}", e);
        Err(FetchError::Offline {
          url: request.url.to_string(),
        })
      }
      Failure::Transport(e) => Err(FetchError::Network(e)),
    }
  }

  fn lookup(&self, key: &RequestKey) -> Option<Response> {
    match self.storage.get(&self.config.cache_name, key) {
      Ok(entry) => entry.map(|c| c.response),
      Err(e) => {
        warn!(key = %key, "Cache lookup failed, treating as miss: {}", e);
        None
      }
    }
  }

  fn shell(&self) -> Option<Response> {
    let url = match self.config.shell_url() {
      Ok(url) => url,
      Err(e) => {
        warn!("Cannot resolve shell url: {}", e);
        return None;
      }
    };
    self.lookup(&RequestKey::get(url))
  }

  /// Store a copy of the response without holding up the caller. If the
  /// event is torn down first, the write is dropped.
  fn write_through(&self, key: RequestKey, response: Response, wait: &WaitUntil) {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.config.cache_name.clone();
    wait.spawn_blocking(move || {
      if let Err(e) = storage.put(&cache_name, &key, &response) {
        warn!(key = %key, "Cache write failed: {}", e);
      }
    });
  }
}

enum Failure {
  Status(Response),
  Transport(NetworkError),
}
