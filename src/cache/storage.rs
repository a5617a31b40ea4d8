//! Cache storage trait and its backends.
//!
//! Backends are plain key/value stores of serialized blobs. They know nothing
//! about entries, expiry or the network; `CacheStore` layers that on top.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store `value` under `key`, replacing any previous value wholesale.
  fn put(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// List all keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

  /// Size in bytes of the value under `key`, without reading it back.
  fn stored_len(&self, key: &str) -> Result<Option<u64>>;
}

impl CacheStorage for Box<dyn CacheStorage> {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    (**self).get(key)
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    (**self).put(key, value)
  }

  fn remove(&self, key: &str) -> Result<()> {
    (**self).remove(key)
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    (**self).keys_with_prefix(prefix)
  }

  fn stored_len(&self, key: &str) -> Result<Option<u64>> {
    (**self).stored_len(key)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn stored_len(&self, _key: &str) -> Result<Option<u64>> {
    Ok(None)
  }
}

/// In-memory storage, optionally bounded by a byte quota.
///
/// A put that would push the total above the quota fails the way a full
/// browser storage area does.
#[derive(Default)]
pub struct MemoryStorage {
  values: Mutex<HashMap<String, Vec<u8>>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      values: Mutex::new(HashMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
    self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut values = self.lock()?;

    if let Some(quota) = self.quota_bytes {
      let used: usize = values
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > quota {
        return Err(eyre!(
          "Storage quota exceeded: {} bytes used, {} requested, {} allowed",
          used,
          key.len() + value.len(),
          quota
        ));
      }
    }

    values.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let mut keys: Vec<String> = self
      .lock()?
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }

  fn stored_len(&self, key: &str) -> Result<Option<u64>> {
    Ok(self.lock()?.get(key).map(|v| v.len() as u64))
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at `path`, creating parent directories.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a throwaway storage backed by an in-memory SQLite database.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("refcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Whole-value key/value store (serialized records)
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;

    conn
      .query_row(
        "SELECT value FROM kv_cache WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache key {}: {}", key, e))
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (key, value, stored_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store cache key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv_cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache key {}: {}", key, e))?;

    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT key FROM kv_cache
         WHERE substr(key, 1, length(?1)) = ?1
         ORDER BY key",
      )
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }

  fn stored_len(&self, key: &str) -> Result<Option<u64>> {
    let conn = self.lock()?;

    let len: Option<i64> = conn
      .query_row(
        "SELECT length(value) FROM kv_cache WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to size cache key {}: {}", key, e))?;

    Ok(len.map(|l| l.max(0) as u64))
  }
}
