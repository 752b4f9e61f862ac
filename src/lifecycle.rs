//! Install and activate handling for one agent version.

use color_eyre::Result;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::config::AgentConfig;
use crate::error::InstallError;
use crate::net::{Network, Request, Response};
use crate::platform::{Clients, Registration};

/// What a successful install wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub cache_name: String,
  pub cached: Vec<RequestKey>,
}

/// What activation cleaned up and claimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Stale stores whose deletion failed; they are left in place
  pub failed: Vec<String>,
  pub claimed: usize,
}

pub struct LifecycleManager {
  config: Arc<AgentConfig>,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  clients: Arc<dyn Clients>,
}

impl LifecycleManager {
  pub fn new(
    config: Arc<AgentConfig>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    Self {
      config,
      storage,
      network,
      clients,
    }
  }

  /// Pre-populate the current store with the manifest.
  ///
  /// All entries are fetched before anything is written, and the write is a
  /// single transaction, so a failed install leaves no entry behind.
  pub async fn install(&self, registration: &dyn Registration) -> Result<InstallReport, InstallError> {
    let cache_name = &self.config.cache_name;
    info!(cache = %cache_name, entries = self.config.manifest.len(), "Installing");

    let urls = self
      .config
      .manifest
      .iter()
      .map(|entry| {
        self.config.resolve(entry).map_err(|e| InstallError::Manifest {
          entry: entry.clone(),
          reason: e.to_string(),
        })
      })
      .collect::<Result<Vec<_>, _>>()?;

    let entries = try_join_all(urls.into_iter().map(|url| self.fetch_entry(url)))
      .await
      .inspect_err(|e| warn!(cache = %cache_name, "Install failed: {}", e))?;

    self
      .storage
      .put_all(cache_name, &entries)
      .map_err(|e| InstallError::Storage {
        cache: cache_name.clone(),
        reason: e.to_string(),
      })?;

    registration.skip_waiting();
    info!(cache = %cache_name, cached = entries.len(), "Installed");

    Ok(InstallReport {
      cache_name: cache_name.clone(),
      cached: entries.into_iter().map(|(key, _)| key).collect(),
    })
  }

  async fn fetch_entry(&self, url: Url) -> Result<(RequestKey, Response), InstallError> {
    let request = Request::get(url);
    let response = self.network.fetch(&request).await?;
    if !response.ok() {
      return Err(InstallError::Status {
        url: request.url.to_string(),
        status: response.status,
      });
    }
    debug!(url = %request.url, "Fetched manifest entry");
    Ok((RequestKey::from(&request), response))
  }

  /// Drop every store but the current one, then claim open pages.
  ///
  /// Deletion is best-effort: failures are logged and reported but never stop
  /// the claim.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let current = &self.config.cache_name;
    let mut report = ActivationReport::default();

    match self.storage.names() {
      Ok(names) => {
        for name in names.into_iter().filter(|n| n != current) {
          match self.storage.delete(&name) {
            Ok(_) => {
              info!(cache = %name, "Deleted stale cache");
              report.deleted.push(name);
            }
            Err(e) => {
              warn!(cache = %name, "Failed to delete stale cache: {}", e);
              report.failed.push(name);
            }
          }
        }
      }
      Err(e) => warn!("Failed to list caches during activation: {}", e),
    }

    report.claimed = self.clients.claim().await?;
    info!(
      cache = %current,
      deleted = report.deleted.len(),
      claimed = report.claimed,
      "Activated"
    );

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::platform::{HeadlessClients, WorkerSlot};
  use crate::testing::{root_config, serve_manifest, MockNetwork};
  use color_eyre::eyre::eyre;

  struct Fixture {
    config: Arc<AgentConfig>,
    storage: Arc<MemoryStorage>,
    network: Arc<MockNetwork>,
    clients: Arc<HeadlessClients>,
  }

  impl Fixture {
    fn new(cache_name: &str) -> Self {
      Self {
        config: Arc::new(root_config(cache_name)),
        storage: Arc::new(MemoryStorage::new()),
        network: Arc::new(MockNetwork::new()),
        clients: Arc::new(HeadlessClients::new()),
      }
    }

    fn manager(&self) -> LifecycleManager {
      LifecycleManager::new(
        self.config.clone(),
        self.storage.clone(),
        self.network.clone(),
        self.clients.clone(),
      )
    }
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_install_caches_exactly_the_manifest() {
    let fx = Fixture::new("v1");
    serve_manifest(&fx.network, &fx.config);
    let slot = WorkerSlot::new();

    let report = fx.manager().install(&slot).await.unwrap();
    assert_eq!(report.cached.len(), 3);

    let mut keys = fx.storage.keys("v1").unwrap();
    keys.sort();
    let mut expected = vec![
      RequestKey::get(url("/")),
      RequestKey::get(url("/manifest.json")),
      RequestKey::get(url("/icon-192x192.png")),
    ];
    expected.sort();
    assert_eq!(keys, expected);
    assert!(slot.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing_on_network_error() {
    let fx = Fixture::new("v1");
    serve_manifest(&fx.network, &fx.config);
    fx.network.fail(&url("/manifest.json"));
    let slot = WorkerSlot::new();

    let err = fx.manager().install(&slot).await.unwrap_err();
    assert!(matches!(err, InstallError::Fetch(_)));
    assert!(fx.storage.keys("v1").unwrap().is_empty());
    assert!(fx.storage.names().unwrap().is_empty());
    assert!(!slot.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let fx = Fixture::new("v1");
    serve_manifest(&fx.network, &fx.config);
    fx.network.respond(&url("/icon-192x192.png"), 404, "missing");

    let err = fx.manager().install(&WorkerSlot::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::Status { status: 404, .. }));
    assert!(fx.storage.names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_prefixes_base_path() {
    let mut config = root_config("v1");
    config.base_path = "/app".to_string();
    let fx = Fixture {
      config: Arc::new(config),
      ..Fixture::new("v1")
    };
    serve_manifest(&fx.network, &fx.config);

    fx.manager().install(&WorkerSlot::new()).await.unwrap();
    assert!(fx
      .storage
      .get("v1", &RequestKey::get(url("/app/manifest.json")))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_activate_keeps_only_current_cache() {
    let fx = Fixture::new("v2");
    fx.storage.open("v0").unwrap();
    fx.storage.open("v1").unwrap();
    fx.storage.open("v2").unwrap();
    fx.clients.attach(url("/")).unwrap();

    let report = fx.manager().activate().await.unwrap();
    assert_eq!(report.deleted, vec!["v0", "v1"]);
    assert!(report.failed.is_empty());
    assert_eq!(report.claimed, 1);
    assert_eq!(fx.storage.names().unwrap(), vec!["v2"]);
  }

  /// Memory storage with switchable failures.
  #[derive(Default)]
  struct FaultyStorage {
    inner: MemoryStorage,
    fail_deletes: bool,
    fail_writes: bool,
  }

  impl CacheStorage for FaultyStorage {
    fn open(&self, name: &str) -> Result<()> {
      self.inner.open(name)
    }
    fn names(&self) -> Result<Vec<String>> {
      self.inner.names()
    }
    fn delete(&self, name: &str) -> Result<bool> {
      if self.fail_deletes {
        return Err(eyre!("cache {} is locked", name));
      }
      self.inner.delete(name)
    }
    fn get(&self, name: &str, key: &RequestKey) -> Result<Option<crate::cache::CachedResponse>> {
      self.inner.get(name, key)
    }
    fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
      self.put_all(name, &[(key.clone(), response.clone())])
    }
    fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
      if self.fail_writes {
        return Err(eyre!("disk full while writing cache {}", name));
      }
      self.inner.put_all(name, entries)
    }
    fn keys(&self, name: &str) -> Result<Vec<RequestKey>> {
      self.inner.keys(name)
    }
  }

  #[tokio::test]
  async fn test_install_fails_when_store_write_fails() {
    let fx = Fixture::new("v1");
    serve_manifest(&fx.network, &fx.config);
    let storage = Arc::new(FaultyStorage {
      fail_writes: true,
      ..FaultyStorage::default()
    });
    let manager = LifecycleManager::new(
      fx.config.clone(),
      storage.clone(),
      fx.network.clone(),
      fx.clients.clone(),
    );
    let slot = WorkerSlot::new();

    let err = manager.install(&slot).await.unwrap_err();
    assert!(matches!(err, InstallError::Storage { ref cache, .. } if cache == "v1"));
    assert!(storage.keys("v1").unwrap().is_empty());
    assert!(storage.names().unwrap().is_empty());
    assert!(!slot.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_install_into_sqlite_leaves_nothing_on_failed_write() {
    let fx = Fixture::new("v1");
    serve_manifest(&fx.network, &fx.config);
    // The shell itself is fine; the icon write is refused mid-transaction
    let storage = Arc::new(crate::cache::SqliteStorage::in_memory().unwrap());
    storage.reject_writes_matching("%/icon-192x192.png");
    let manager = LifecycleManager::new(
      fx.config.clone(),
      storage.clone(),
      fx.network.clone(),
      fx.clients.clone(),
    );
    let slot = WorkerSlot::new();

    let err = manager.install(&slot).await.unwrap_err();
    assert!(matches!(err, InstallError::Storage { .. }));
    assert!(storage.keys("v1").unwrap().is_empty());
    assert!(storage.names().unwrap().is_empty());
    assert!(!slot.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_activate_claims_even_when_cleanup_fails() {
    let storage = FaultyStorage {
      fail_deletes: true,
      ..FaultyStorage::default()
    };
    storage.open("old").unwrap();
    let clients = Arc::new(HeadlessClients::new());
    clients.attach(url("/")).unwrap();

    let manager = LifecycleManager::new(
      Arc::new(root_config("new")),
      Arc::new(storage),
      Arc::new(MockNetwork::new()),
      clients.clone(),
    );

    let report = manager.activate().await.unwrap();
    assert_eq!(report.failed, vec!["old"]);
    assert!(report.deleted.is_empty());
    assert_eq!(report.claimed, 1);
  }
}
