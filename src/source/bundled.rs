//! Bundled snapshot of reference content shipped with the application.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::resource_file_name;
use crate::content::ContentPayload;
use crate::error::{Error, Result};

/// A local, always-available (possibly outdated) content provider.
///
/// Implementations never touch the network.
pub trait BundledSource: Send + Sync {
  /// Bundled payload for `resource_id`, `Ok(None)` if none ships with the app.
  fn get(&self, resource_id: &str) -> Result<Option<ContentPayload>>;
}

/// Bundle laid out as `<dir>/<resource_id>.json` files.
#[derive(Debug, Clone)]
pub struct DirBundle {
  dir: PathBuf,
}

impl DirBundle {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }
}

impl BundledSource for DirBundle {
  fn get(&self, resource_id: &str) -> Result<Option<ContentPayload>> {
    let Some(file_name) = resource_file_name(resource_id) else {
      debug!(resource_id, "Resource id cannot name a bundled file");
      return Ok(None);
    };
    let path = self.dir.join(file_name);

    let contents = match std::fs::read_to_string(&path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(Error::Parse(format!(
          "Failed to read bundled file {}: {}",
          path.display(),
          e
        )))
      }
    };

    serde_json::from_str(&contents)
      .map(Some)
      .map_err(|e| Error::Parse(format!("Invalid bundled file {}: {}", path.display(), e)))
  }
}

/// In-memory bundle, e.g. built from `include_str!` snapshots.
#[derive(Debug, Clone, Default)]
pub struct StaticBundle {
  payloads: HashMap<String, ContentPayload>,
}

impl StaticBundle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, resource_id: impl Into<String>, payload: ContentPayload) -> Self {
    self.payloads.insert(resource_id.into(), payload);
    self
  }

  /// Add a payload given as JSON text.
  pub fn with_json(self, resource_id: impl Into<String>, json: &str) -> Result<Self> {
    let payload =
      serde_json::from_str(json).map_err(|e| Error::Parse(format!("Invalid bundled payload: {}", e)))?;
    Ok(self.with(resource_id, payload))
  }
}

impl BundledSource for StaticBundle {
  fn get(&self, resource_id: &str) -> Result<Option<ContentPayload>> {
    Ok(self.payloads.get(resource_id).cloned())
  }
}
