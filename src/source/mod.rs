//! Providers of content payloads.
//!
//! Two adapters besides the cache itself:
//! - `BundledSource`: shipped with the application, always available, never expires
//! - `RemoteSource`: the network authority, may fail

mod bundled;
mod remote;

pub use bundled::{BundledSource, DirBundle, StaticBundle};
pub use remote::{HttpRemote, RemoteSource};

/// File name for a resource id, or `None` if the id cannot name a file
/// safely (empty, absolute, or containing `..` components).
pub(crate) fn resource_file_name(resource_id: &str) -> Option<String> {
  let valid_chars = resource_id
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));

  if resource_id.is_empty()
    || !valid_chars
    || resource_id.starts_with('/')
    || resource_id.split('/').any(|part| part.is_empty() || part == "." || part == "..")
  {
    return None;
  }

  Some(format!("{}.json", resource_id))
}
