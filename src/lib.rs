//! Offline-first cache and sync layer for rule and perk reference content.
//!
//! Reads are answered from a persistent cache or a bundled snapshot without
//! waiting on the network, while a background fetch from the remote authority
//! keeps the cache converging on the latest published version. Consumers
//! subscribe to `ContentUpdate`s to learn when fresher content has landed.
//!
//! ```ignore
//! let config = refcache::Config::load(None)?;
//! let sync = config.orchestrator()?;
//! let mut updates = sync.subscribe();
//!
//! let perks = sync.load("perks").await?;
//! // later...
//! if let Ok(update) = updates.recv().await {
//!     // re-read update.payload
//! }
//! ```

pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod source;
pub mod sync;
pub mod version;

pub use config::Config;
pub use content::{ContentPayload, ContentUpdate};
pub use error::{Error, Result};
pub use sync::{LoadSource, Loaded, SyncOrchestrator, TtlPolicy};
