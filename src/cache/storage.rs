//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use url::Url;

use super::traits::{CachedResponse, RequestKey};
use crate::net::{Method, Response};

/// Named cache stores holding request/response pairs.
///
/// Writes to different keys may race freely; a second write to the same key
/// replaces the first.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Names of all stores, oldest first.
  fn names(&self) -> Result<Vec<String>>;

  /// Delete a store and everything in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a single entry, creating the store if needed.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several entries at once. Either all of them are written or none.
  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Keys of every entry in a store.
  fn keys(&self, name: &str) -> Result<Vec<RequestKey>>;
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  stores: RwLock<Vec<(String, BTreeMap<RequestKey, CachedResponse>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !stores.iter().any(|(n, _)| n == name) {
      stores.push((name.to_string(), BTreeMap::new()));
    }
    Ok(())
  }

  fn names(&self) -> Result<Vec<String>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.iter().map(|(n, _)| n.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = stores.len();
    stores.retain(|(n, _)| n != name);
    Ok(stores.len() != before)
  }

  fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      stores
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, entries)| entries.get(key).cloned()),
    )
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.put_all(name, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut stores = self
      .stores
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let index = match stores.iter().position(|(n, _)| n == name) {
      Some(i) => i,
      None => {
        stores.push((name.to_string(), BTreeMap::new()));
        stores.len() - 1
      }
    };

    let now = Utc::now();
    let store = &mut stores[index].1;
    for (key, response) in entries {
      store.insert(
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: now,
        },
      );
    }

    Ok(())
  }

  fn keys(&self, name: &str) -> Result<Vec<RequestKey>> {
    let stores = self
      .stores
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      stores
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, entries)| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A database that is discarded when the storage is dropped.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per named cache store
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, key_hash),
    FOREIGN KEY (cache_name) REFERENCES cache_names(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

fn insert_name(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
  let data =
    serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, key_hash, method, url, response, cached_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![name, key.cache_hash(), key.method.as_str(), key.url.as_str(), data],
    )
    .map_err(|e| eyre!("Failed to store {} in cache {}: {}", key, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    insert_name(&conn, name)
  }

  fn names(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM cache_entries WHERE cache_name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT response, cached_at FROM cache_entries
         WHERE cache_name = ? AND key_hash = ?",
        params![name, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", key, name, e))?;

    match row {
      Some((data, cached_at_str)) => {
        let response: Response = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cached response: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_name(&tx, name)?;
    insert_entry(&tx, name, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    insert_name(&tx, name)?;
    for (key, response) in entries {
      insert_entry(&tx, name, key, response)?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self, name: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list keys of cache {}: {}", name, e))?
      .collect::<std::result::Result<Vec<(String, String)>, _>>()
      .map_err(|e| eyre!("Failed to read key of cache {}: {}", name, e))?;

    rows
      .into_iter()
      .map(|(method, url)| -> Result<RequestKey> {
        let method: Method = method.parse()?;
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid cached url '{}': {}", url, e))?;
        Ok(RequestKey::new(method, url))
      })
      .collect()
  }
}

#[cfg(test)]
impl SqliteStorage {
  /// Make any entry insert whose url matches the LIKE `pattern` fail inside
  /// its transaction.
  pub(crate) fn reject_writes_matching(&self, pattern: &str) {
    self
      .conn
      .lock()
      .unwrap()
      .execute_batch(&format!(
        "CREATE TRIGGER reject_writes BEFORE INSERT ON cache_entries
         WHEN NEW.url LIKE '{}'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        pattern
      ))
      .unwrap();
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(Url::parse("http://localhost").unwrap().join(path).unwrap())
  }

  fn response(key: &RequestKey, body: &str) -> Response {
    Response::new(key.url.clone(), 200, body)
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("memory", Box::new(MemoryStorage::new())),
      ("sqlite", Box::new(SqliteStorage::in_memory().unwrap())),
    ]
  }

  #[test]
  fn test_put_then_get() {
    for (label, storage) in backends() {
      let k = key("/index.html");
      storage.put("v1", &k, &response(&k, "hello")).unwrap();

      let cached = storage.get("v1", &k).unwrap().expect(label);
      assert_eq!(cached.response.text(), "hello", "{}", label);
      let age = Utc::now() - cached.cached_at;
      assert!(age >= chrono::Duration::zero() && age < chrono::Duration::minutes(1), "{}", label);
      assert!(storage.get("v2", &k).unwrap().is_none(), "{}", label);
    }
  }

  #[test]
  fn test_same_key_last_write_wins() {
    for (label, storage) in backends() {
      let k = key("/a");
      storage.put("v1", &k, &response(&k, "first")).unwrap();
      storage.put("v1", &k, &response(&k, "second")).unwrap();

      assert_eq!(storage.keys("v1").unwrap().len(), 1, "{}", label);
      let cached = storage.get("v1", &k).unwrap().unwrap();
      assert_eq!(cached.response.text(), "second", "{}", label);
    }
  }

  #[test]
  fn test_names_in_creation_order_and_delete() {
    for (label, storage) in backends() {
      storage.open("old").unwrap();
      storage.open("current").unwrap();
      storage.open("old").unwrap();
      assert_eq!(storage.names().unwrap(), vec!["old", "current"], "{}", label);

      assert!(storage.delete("old").unwrap(), "{}", label);
      assert!(!storage.delete("old").unwrap(), "{}", label);
      assert_eq!(storage.names().unwrap(), vec!["current"], "{}", label);
    }
  }

  #[test]
  fn test_delete_drops_entries() {
    for (label, storage) in backends() {
      let k = key("/x");
      storage.put("v1", &k, &response(&k, "x")).unwrap();
      storage.delete("v1").unwrap();
      storage.open("v1").unwrap();
      assert!(storage.get("v1", &k).unwrap().is_none(), "{}", label);
    }
  }

  #[test]
  fn test_put_all_stores_every_entry() {
    for (label, storage) in backends() {
      let entries: Vec<_> = ["/", "/manifest.json", "/icon.png"]
        .iter()
        .map(|p| {
          let k = key(p);
          let r = response(&k, p);
          (k, r)
        })
        .collect();

      storage.put_all("v1", &entries).unwrap();

      let mut keys = storage.keys("v1").unwrap();
      keys.sort();
      let mut expected: Vec<_> = entries.into_iter().map(|(k, _)| k).collect();
      expected.sort();
      assert_eq!(keys, expected, "{}", label);
    }
  }

  #[test]
  fn test_sqlite_put_all_rolls_back_on_failed_entry() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.reject_writes_matching("%/broken.png");

    let entries: Vec<_> = ["/", "/broken.png", "/manifest.json"]
      .iter()
      .map(|p| {
        let k = key(p);
        let r = response(&k, p);
        (k, r)
      })
      .collect();

    assert!(storage.put_all("v1", &entries).is_err());
    assert!(storage.keys("v1").unwrap().is_empty());
    assert!(storage.names().unwrap().is_empty());
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let k = key("/persisted");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("v1", &k, &response(&k, "kept")).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.names().unwrap(), vec!["v1"]);
    let cached = storage.get("v1", &k).unwrap().unwrap();
    assert_eq!(cached.response.text(), "kept");
  }
}
