//! Remote authority for reference content.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::ACCEPT;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::resource_file_name;
use crate::content::ContentPayload;
use crate::error::{Error, Result};

/// The network-bound source of truth.
pub trait RemoteSource: Send + Sync {
  /// Fetch the current payload for `resource_id`.
  ///
  /// Fails with `Error::Transport` when the authority can't be reached or
  /// answers with a non-success status, and `Error::Parse` when the body is
  /// not a content payload.
  fn fetch<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<ContentPayload>>;

  /// Location recorded alongside cached payloads.
  fn location(&self, _resource_id: &str) -> Option<String> {
    None
  }
}

/// HTTP authority serving `<base_url>/<resource_id>.json`.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpRemote {
  /// Create a client for `base_url`. Without a timeout the transport default applies.
  pub fn new(base_url: &str, timeout: Option<Duration>) -> color_eyre::Result<Self> {
    // Url::join replaces the last segment unless the base ends with '/'
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url = Url::parse(&normalized)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid remote base URL {}: {}", base_url, e))?;

    let mut builder = reqwest::Client::builder().user_agent(concat!("refcache/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn resource_url(&self, resource_id: &str) -> Result<Url> {
    let file_name = resource_file_name(resource_id)
      .ok_or_else(|| Error::Transport(format!("Invalid resource id '{}'", resource_id)))?;
    self
      .base_url
      .join(&file_name)
      .map_err(|e| Error::Transport(format!("Invalid URL for '{}': {}", resource_id, e)))
  }

  /// Fetch and decode the payload for `resource_id`.
  pub async fn fetch_payload(&self, resource_id: &str) -> Result<ContentPayload> {
    let url = self.resource_url(resource_id)?;
    debug!(resource_id, url = %url, "Fetching remote payload");

    let response = self
      .client
      .get(url)
      .header(ACCEPT, "application/json")
      .send()
      .await?;

    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
      return Err(Error::from_status(status, &body));
    }

    serde_json::from_str(&body)
      .map_err(|e| Error::Parse(format!("Invalid payload for '{}': {}", resource_id, e)))
  }
}

impl RemoteSource for HttpRemote {
  fn fetch<'a>(&'a self, resource_id: &'a str) -> BoxFuture<'a, Result<ContentPayload>> {
    self.fetch_payload(resource_id).boxed()
  }

  fn location(&self, resource_id: &str) -> Option<String> {
    self.resource_url(resource_id).ok().map(String::from)
  }
}
