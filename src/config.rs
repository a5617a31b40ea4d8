use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStorage, CacheStore, NoopStorage, SqliteStorage};
use crate::source::{BundledSource, DirBundle, HttpRemote, StaticBundle};
use crate::sync::{SyncOrchestrator, TtlPolicy};

/// Environment variable overriding `remote.base_url`
pub const REMOTE_URL_ENV: &str = "REFCACHE_REMOTE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub bundle: BundleConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub ttl: TtlConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
  /// Base location of the authority; resources live at `<base_url>/<id>.json`
  pub base_url: Option<String>,
  /// Request timeout. Unset leaves the transport default in place.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleConfig {
  /// Directory holding `<id>.json` snapshots shipped with the application
  pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// SQLite database path (default: $XDG_DATA_HOME/refcache/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TtlConfig {
  /// Class used for resources without an assignment
  pub default_class: Option<String>,
  /// Class name -> TTL in hours
  #[serde(default)]
  pub classes: BTreeMap<String, u64>,
  /// Resource id -> class name
  #[serde(default)]
  pub resources: BTreeMap<String, String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./refcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/refcache/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("refcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("refcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Remote base URL, preferring the `REFCACHE_REMOTE_URL` environment variable.
  pub fn remote_url(&self) -> Result<String> {
    std::env::var(REMOTE_URL_ENV)
      .ok()
      .filter(|url| !url.trim().is_empty())
      .or_else(|| self.remote.base_url.clone())
      .ok_or_else(|| {
        eyre!(
          "No remote base URL configured. Set remote.base_url or the {} environment variable.",
          REMOTE_URL_ENV
        )
      })
  }

  /// Build the TTL policy. Fails when a class TTL does not fit a duration.
  pub fn ttl_policy(&self) -> Result<TtlPolicy> {
    let mut policy = TtlPolicy::default();

    if let Some(class) = &self.ttl.default_class {
      policy = policy.with_default_class(class.clone());
    }
    for (class, hours) in &self.ttl.classes {
      let ttl = i64::try_from(*hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .ok_or_else(|| eyre!("TTL for class '{}' out of range: {} hours", class, hours))?;
      policy = policy.with_class(class.clone(), ttl);
    }
    for (resource_id, class) in &self.ttl.resources {
      policy = policy.assign(resource_id.clone(), class.clone());
    }

    Ok(policy)
  }

  /// Open the configured storage backend.
  pub fn open_storage(&self) -> Result<Box<dyn CacheStorage>> {
    if !self.cache.enabled {
      return Ok(Box::new(NoopStorage));
    }

    let storage = match &self.cache.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    Ok(Box::new(storage))
  }

  pub fn bundled_source(&self) -> Arc<dyn BundledSource> {
    match &self.bundle.dir {
      Some(dir) => Arc::new(DirBundle::new(dir.clone())),
      None => Arc::new(StaticBundle::new()),
    }
  }

  /// Wire up an orchestrator from this configuration.
  pub fn orchestrator(&self) -> Result<SyncOrchestrator<Box<dyn CacheStorage>>> {
    let ttl = self.ttl_policy()?;
    let timeout = self.remote.timeout_secs.map(Duration::from_secs);
    let remote = HttpRemote::new(&self.remote_url()?, timeout)?;
    let cache = CacheStore::new(self.open_storage()?);

    Ok(SyncOrchestrator::new(
      cache,
      self.bundled_source(),
      Arc::new(remote),
      ttl,
    ))
  }
}
