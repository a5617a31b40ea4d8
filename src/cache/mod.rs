//! Persistent caching of reference content.
//!
//! This module provides:
//! - `CacheStorage` backends (SQLite, in-memory, no-op)
//! - `CacheStore`, which keeps timestamped payloads with an expiry per entry
//! - An enumeration index used for statistics and bulk clearing

mod entry;
mod storage;
mod store;

pub use entry::{age_display, now_millis, CacheEntry, CacheMeta, CacheStats};
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use store::{CacheStore, ENTRY_PREFIX, META_KEY};
