//! Reference content payloads and update notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A versioned bundle of reference records.
///
/// `body` is opaque to the cache layer; only `version` and `last_updated`
/// are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPayload {
  /// Opaque revision marker (commit sha, ISO timestamp, ...)
  pub version: String,
  /// Epoch millis of the last content change
  pub last_updated: i64,
  pub body: Value,
}

impl ContentPayload {
  pub fn new(version: impl Into<String>, last_updated: i64, body: Value) -> Self {
    Self {
      version: version.into(),
      last_updated,
      body,
    }
  }
}

/// Broadcast when a refresh determines that content changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate {
  pub resource_id: String,
  pub payload: ContentPayload,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_payload_uses_camel_case_fields() {
    let payload = ContentPayload::new("abc123", 1_700_000_000_000, json!({"perks": []}));
    let value = serde_json::to_value(&payload).unwrap();
    assert_eq!(value["lastUpdated"], json!(1_700_000_000_000i64));
    assert_eq!(value["version"], json!("abc123"));
  }

  #[test]
  fn test_payload_rejects_missing_version() {
    let result: Result<ContentPayload, _> =
      serde_json::from_str(r#"{"lastUpdated": 1, "body": {}}"#);
    assert!(result.is_err());
  }
}
