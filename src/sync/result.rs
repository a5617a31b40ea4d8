//! Load results tagged with the tier that produced them.

use crate::content::ContentPayload;

/// Result from a load, including the payload and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
  pub payload: ContentPayload,
  /// Where the payload came from
  pub source: LoadSource,
  /// When the payload was cached (if from cache)
  pub fetched_at: Option<i64>,
}

impl Loaded {
  /// A fresh cache hit.
  pub fn from_cache(payload: ContentPayload, fetched_at: i64) -> Self {
    Self {
      payload,
      source: LoadSource::CacheFresh,
      fetched_at: Some(fetched_at),
    }
  }

  /// The snapshot shipped with the application.
  pub fn bundled(payload: ContentPayload) -> Self {
    Self {
      payload,
      source: LoadSource::Bundled,
      fetched_at: None,
    }
  }

  /// Fetched synchronously from the authority.
  pub fn from_network(payload: ContentPayload) -> Self {
    Self {
      payload,
      source: LoadSource::Network,
      fetched_at: None,
    }
  }

  /// Stale cache served because the authority could not be reached.
  pub fn offline(payload: ContentPayload, fetched_at: i64) -> Self {
    Self {
      payload,
      source: LoadSource::Offline,
      fetched_at: Some(fetched_at),
    }
  }
}

/// Indicates which tier answered a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
  /// Cache entry within its TTL
  CacheFresh,
  /// Bundled snapshot
  Bundled,
  /// Fresh data from network
  Network,
  /// Offline mode - network unavailable, serving a stale cache entry
  Offline,
}

impl LoadSource {
  pub fn label(&self) -> &'static str {
    match self {
      LoadSource::CacheFresh => "cache",
      LoadSource::Bundled => "bundled",
      LoadSource::Network => "network",
      LoadSource::Offline => "stale cache (offline)",
    }
  }
}
