//! Stale-while-revalidate synchronization of reference content.
//!
//! `SyncOrchestrator` answers reads from the cache or the bundled snapshot
//! immediately, revalidates against the remote authority in the background,
//! and broadcasts a `ContentUpdate` when a newer payload lands.

mod orchestrator;
mod result;
mod ttl;

pub use orchestrator::SyncOrchestrator;
pub use result::{LoadSource, Loaded};
pub use ttl::{TtlPolicy, DATABASE_CLASS, FILE_CLASS};
