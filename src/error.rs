//! Error taxonomy for the reference-content layer.

use thiserror::Error;

/// Errors raised while obtaining reference content.
///
/// Only `ContentUnavailable` is meant to reach the user-visible layer; the
/// other variants are recovered or downgraded inside the crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// Network or HTTP failure reaching the remote authority.
  #[error("Transport error: {0}")]
  Transport(String),

  /// A remote or bundled payload did not match the expected shape.
  #[error("Parse error: {0}")]
  Parse(String),

  /// A stored cache record failed to deserialize or verify.
  #[error("Cache corruption in {key}: {reason}")]
  CacheCorruption { key: String, reason: String },

  /// No tier (cache, bundle or remote) could produce a payload.
  #[error("No reference content available for '{resource_id}'")]
  ContentUnavailable {
    resource_id: String,
    #[source]
    cause: Option<Box<Error>>,
  },
}

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 300;

impl Error {
  pub fn unavailable(resource_id: &str, cause: Option<Error>) -> Self {
    Error::ContentUnavailable {
      resource_id: resource_id.to_string(),
      cause: cause.map(Box::new),
    }
  }

  /// Build a transport error for a non-success HTTP status.
  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let body = if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    };
    Error::Transport(format!("Status {}: {}", status, body))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Error::Transport(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_status_truncates_long_bodies() {
    let body = "x".repeat(1000);
    let err = Error::from_status(reqwest::StatusCode::BAD_GATEWAY, &body);
    let Error::Transport(msg) = err else {
      panic!("expected transport error");
    };
    assert!(msg.contains("502"));
    assert!(msg.contains("truncated, 1000 total bytes"));
  }

  #[test]
  fn test_unavailable_keeps_cause() {
    let err = Error::unavailable("perks", Some(Error::Transport("offline".into())));
    let source = std::error::Error::source(&err).map(|s| s.to_string());
    assert_eq!(source.as_deref(), Some("Transport error: offline"));
    assert!(err.to_string().contains("perks"));
  }
}
