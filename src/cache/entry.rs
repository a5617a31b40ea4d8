//! Cache entry, index and statistics types.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::content::ContentPayload;

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// A cached payload with its freshness window.
///
/// `expires_at` is always `fetched_at + ttl`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub resource_id: String,
  pub payload: ContentPayload,
  pub fetched_at: i64,
  pub expires_at: i64,
  /// Where the payload was fetched from, if known
  pub source_url: Option<String>,
}

impl CacheEntry {
  /// Fresh means `fetched_at <= now <= expires_at`.
  pub fn is_fresh_at(&self, now: i64) -> bool {
    self.fetched_at <= now && now <= self.expires_at
  }

  pub fn is_fresh(&self) -> bool {
    self.is_fresh_at(now_millis())
  }

  pub fn is_stale(&self) -> bool {
    now_millis() > self.expires_at
  }

  /// Fetch time as a UTC timestamp, `None` when outside chrono's range.
  pub fn fetched_at_utc(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.fetched_at).single()
  }

  /// Human-readable age, e.g. "5m ago".
  pub fn age_display(&self) -> String {
    age_display(self.fetched_at, now_millis())
  }
}

/// Render the age of `then` relative to `now` (both epoch millis).
pub fn age_display(then: i64, now: i64) -> String {
  let minutes = now.saturating_sub(then) / 60_000;
  if minutes < 1 {
    // Also covers clock skew
    "just now".to_string()
  } else if minutes < 60 {
    format!("{}m ago", minutes)
  } else if minutes < 1440 {
    let hours = minutes / 60;
    if minutes % 60 >= 30 {
      format!("{}h ago", hours + 1)
    } else {
      format!("{}h ago", hours)
    }
  } else {
    let days = minutes / 1440;
    if (minutes % 1440) / 60 >= 12 {
      format!("{}d ago", days + 1)
    } else {
      format!("{}d ago", days)
    }
  }
}

/// Serialized form of a cache entry as kept in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredRecord {
  pub payload: ContentPayload,
  pub fetched_at: i64,
  pub expires_at: i64,
  pub source_url: Option<String>,
  /// SHA-256 hex of the serialized payload
  pub checksum: String,
}

impl StoredRecord {
  pub fn new(payload: ContentPayload, fetched_at: i64, ttl: Duration, source_url: Option<String>) -> Self {
    let checksum = payload_checksum(&payload);
    Self {
      payload,
      fetched_at,
      expires_at: fetched_at.saturating_add(ttl.num_milliseconds()),
      source_url,
      checksum,
    }
  }

  pub fn verify(&self) -> bool {
    payload_checksum(&self.payload) == self.checksum
  }

  pub fn into_entry(self, resource_id: &str) -> CacheEntry {
    CacheEntry {
      resource_id: resource_id.to_string(),
      payload: self.payload,
      fetched_at: self.fetched_at,
      expires_at: self.expires_at,
      source_url: self.source_url,
    }
  }
}

fn payload_checksum(payload: &ContentPayload) -> String {
  // Serializing a Value keeps map keys sorted, so this is stable.
  let bytes = serde_json::to_vec(payload).unwrap_or_default();
  let mut hasher = Sha256::new();
  hasher.update(&bytes);
  hex::encode(hasher.finalize())
}

/// Enumeration index over cached entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMeta {
  /// Epoch millis of the most recent write
  pub last_fetch: i64,
  /// Resource id -> fetched_at
  pub files: BTreeMap<String, i64>,
}

/// Diagnostics snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub count: usize,
  pub oldest_fetched_at: Option<i64>,
  pub newest_fetched_at: Option<i64>,
  pub total_bytes: u64,
}
