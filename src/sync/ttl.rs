//! Time-to-live policy per resource class.

use chrono::Duration;
use std::collections::HashMap;

/// Class for whole-database resources.
pub const DATABASE_CLASS: &str = "database";

/// Class for individual reference files.
pub const FILE_CLASS: &str = "file";

/// Maps resource ids to a class and classes to a TTL.
///
/// Ids without an explicit assignment use the default class; a class without
/// a configured TTL falls back to the default class's TTL.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
  default_class: String,
  classes: HashMap<String, Duration>,
  resources: HashMap<String, String>,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    let mut classes = HashMap::new();
    classes.insert(DATABASE_CLASS.to_string(), Duration::days(7));
    classes.insert(FILE_CLASS.to_string(), Duration::hours(24));

    Self {
      default_class: FILE_CLASS.to_string(),
      classes,
      resources: HashMap::new(),
    }
  }
}

impl TtlPolicy {
  /// Same TTL for every resource.
  pub fn uniform(ttl: Duration) -> Self {
    let mut classes = HashMap::new();
    classes.insert(FILE_CLASS.to_string(), ttl);
    Self {
      default_class: FILE_CLASS.to_string(),
      classes,
      resources: HashMap::new(),
    }
  }

  pub fn with_default_class(mut self, class: impl Into<String>) -> Self {
    self.default_class = class.into();
    self
  }

  pub fn with_class(mut self, class: impl Into<String>, ttl: Duration) -> Self {
    self.classes.insert(class.into(), ttl);
    self
  }

  /// Assign `resource_id` to `class`.
  pub fn assign(mut self, resource_id: impl Into<String>, class: impl Into<String>) -> Self {
    self.resources.insert(resource_id.into(), class.into());
    self
  }

  pub fn class_of<'a>(&'a self, resource_id: &str) -> &'a str {
    self
      .resources
      .get(resource_id)
      .map(String::as_str)
      .unwrap_or(&self.default_class)
  }

  pub fn ttl_for(&self, resource_id: &str) -> Duration {
    self
      .classes
      .get(self.class_of(resource_id))
      .or_else(|| self.classes.get(&self.default_class))
      .copied()
      .unwrap_or_else(|| Duration::hours(24))
  }
}
