//! Key-scoped store of timestamped content payloads.

use chrono::Duration;
use std::sync::Mutex;
use tracing::{debug, warn};

use super::entry::{now_millis, CacheEntry, CacheMeta, CacheStats, StoredRecord};
use super::storage::CacheStorage;
use crate::content::ContentPayload;
use crate::error::{Error, Result};

/// Prefix for per-resource entry keys.
pub const ENTRY_PREFIX: &str = "refcache:entry:";

/// Key of the enumeration index record.
pub const META_KEY: &str = "refcache:meta";

/// Persistent store of cache entries on top of a `CacheStorage` backend.
///
/// None of the operations fail from the caller's point of view: storage
/// problems are logged and degrade to a cache miss or a dropped write.
pub struct CacheStore<S: CacheStorage> {
  storage: S,
  /// Serializes read-modify-write of the index record
  meta_lock: Mutex<()>,
}

impl<S: CacheStorage> CacheStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage,
      meta_lock: Mutex::new(()),
    }
  }

  /// Access the underlying backend.
  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn entry_key(resource_id: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, resource_id)
  }

  /// Read the entry for `resource_id`, fresh or stale.
  ///
  /// A record that fails to decode or verify is purged and reported as absent.
  pub fn read(&self, resource_id: &str) -> Option<CacheEntry> {
    let key = Self::entry_key(resource_id);

    let raw = match self.storage.get(&key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(resource_id, error = %e, "Cache read failed, treating as miss");
        return None;
      }
    };

    match decode_record(&key, &raw) {
      Ok(record) => Some(record.into_entry(resource_id)),
      Err(e) => {
        warn!(resource_id, error = %e, "Purging corrupted cache entry");
        self.invalidate(resource_id);
        None
      }
    }
  }

  /// Store `payload` for `resource_id`, valid for `ttl` from now.
  pub fn write(&self, resource_id: &str, payload: &ContentPayload, ttl: Duration) {
    self.write_with_source(resource_id, payload, ttl, None);
  }

  /// Like `write`, also recording where the payload came from.
  pub fn write_with_source(
    &self,
    resource_id: &str,
    payload: &ContentPayload,
    ttl: Duration,
    source_url: Option<&str>,
  ) {
    let fetched_at = now_millis();
    let record = StoredRecord::new(payload.clone(), fetched_at, ttl, source_url.map(String::from));

    let bytes = match serde_json::to_vec(&record) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(resource_id, error = %e, "Failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.storage.put(&Self::entry_key(resource_id), &bytes) {
      warn!(resource_id, error = %e, "Cache write dropped");
      return;
    }

    debug!(resource_id, version = %payload.version, expires_at = record.expires_at, "Cached payload");

    self.update_meta(|meta| {
      meta.last_fetch = meta.last_fetch.max(fetched_at);
      meta.files.insert(resource_id.to_string(), fetched_at);
    });
  }

  /// Remove the entry for `resource_id`.
  pub fn invalidate(&self, resource_id: &str) {
    if let Err(e) = self.storage.remove(&Self::entry_key(resource_id)) {
      warn!(resource_id, error = %e, "Failed to remove cache entry");
    }
    self.update_meta(|meta| {
      meta.files.remove(resource_id);
    });
  }

  /// Remove every entry and the index.
  pub fn invalidate_all(&self) {
    let _guard = self.meta_lock.lock().unwrap_or_else(|e| e.into_inner());

    let mut keys: Vec<String> = self
      .read_meta()
      .map(|meta| meta.files.keys().map(|id| Self::entry_key(id)).collect())
      .unwrap_or_default();

    match self.storage.keys_with_prefix(ENTRY_PREFIX) {
      Ok(found) => keys.extend(found),
      Err(e) => warn!(error = %e, "Failed to enumerate cache keys"),
    }
    keys.sort();
    keys.dedup();
    let removed = keys.len();
    keys.push(META_KEY.to_string());

    for key in &keys {
      if let Err(e) = self.storage.remove(key) {
        warn!(key = %key, error = %e, "Failed to remove cache key");
      }
    }

    debug!(removed, "Cleared cache");
  }

  /// The enumeration index, rebuilt if missing or corrupt.
  pub fn index(&self) -> CacheMeta {
    let _guard = self.meta_lock.lock().unwrap_or_else(|e| e.into_inner());
    self.load_meta()
  }

  /// Diagnostics over the cached entries.
  pub fn stats(&self) -> CacheStats {
    let meta = self.index();
    let mut stats = CacheStats::default();

    for (resource_id, &fetched_at) in &meta.files {
      let size = match self.storage.stored_len(&Self::entry_key(resource_id)) {
        Ok(Some(size)) => size,
        Ok(None) => continue, // dangling index slot
        Err(e) => {
          debug!(resource_id = %resource_id, error = %e, "Failed to size cache entry");
          continue;
        }
      };

      stats.count += 1;
      stats.total_bytes += size;
      stats.oldest_fetched_at = Some(stats.oldest_fetched_at.map_or(fetched_at, |o| o.min(fetched_at)));
      stats.newest_fetched_at = Some(stats.newest_fetched_at.map_or(fetched_at, |n| n.max(fetched_at)));
    }

    stats
  }

  fn update_meta(&self, apply: impl FnOnce(&mut CacheMeta)) {
    let _guard = self.meta_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut meta = self.load_meta();
    apply(&mut meta);
    self.store_meta(&meta);
  }

  /// Caller must hold `meta_lock`.
  fn load_meta(&self) -> CacheMeta {
    match self.read_meta() {
      Some(meta) => meta,
      None => {
        let meta = self.rebuild_meta();
        self.store_meta(&meta);
        meta
      }
    }
  }

  fn read_meta(&self) -> Option<CacheMeta> {
    let raw = match self.storage.get(META_KEY) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(error = %e, "Failed to read cache index");
        return None;
      }
    };

    match serde_json::from_slice(&raw) {
      Ok(meta) => Some(meta),
      Err(e) => {
        warn!(error = %e, "Cache index corrupted, rebuilding");
        None
      }
    }
  }

  fn store_meta(&self, meta: &CacheMeta) {
    let result = serde_json::to_vec(meta)
      .map_err(|e| e.to_string())
      .and_then(|bytes| self.storage.put(META_KEY, &bytes).map_err(|e| e.to_string()));
    if let Err(e) = result {
      warn!(error = %e, "Failed to store cache index");
    }
  }

  /// Rebuild the index by enumerating stored entries. Corrupt entries found
  /// along the way are removed.
  fn rebuild_meta(&self) -> CacheMeta {
    let mut meta = CacheMeta::default();

    let keys = match self.storage.keys_with_prefix(ENTRY_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "Failed to enumerate cache keys");
        return meta;
      }
    };

    for key in keys {
      let Some(resource_id) = key.strip_prefix(ENTRY_PREFIX) else {
        continue;
      };
      let Ok(Some(raw)) = self.storage.get(&key) else {
        continue;
      };
      match decode_record(&key, &raw) {
        Ok(record) => {
          meta.last_fetch = meta.last_fetch.max(record.fetched_at);
          meta.files.insert(resource_id.to_string(), record.fetched_at);
        }
        Err(e) => {
          warn!(key = %key, error = %e, "Dropping corrupted cache entry");
          let _ = self.storage.remove(&key);
        }
      }
    }

    meta
  }
}

fn decode_record(key: &str, raw: &[u8]) -> Result<StoredRecord> {
  let corruption = |reason: String| Error::CacheCorruption {
    key: key.to_string(),
    reason,
  };

  let record: StoredRecord = serde_json::from_slice(raw).map_err(|e| corruption(e.to_string()))?;

  if !record.verify() {
    return Err(corruption("checksum mismatch".to_string()));
  }
  if record.expires_at < record.fetched_at {
    return Err(corruption("expiry precedes fetch time".to_string()));
  }

  Ok(record)
}
