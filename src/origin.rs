//! HTTP origin: fetches a JSON document for an entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::EXPIRES;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{Fetch, Loaded};

/// Origin fetcher for a JSON endpoint.
///
/// A 404 means the value is known to be absent. An `Expires` response header,
/// when present, becomes the fetched expiration; the chain clamps it to its
/// ceiling either way.
#[derive(Clone)]
pub struct HttpFetch {
  client: reqwest::Client,
  url: Url,
}

impl HttpFetch {
  pub fn new(url: &str) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Self::with_client(client, url)
  }

  pub fn with_client(client: reqwest::Client, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid origin url {:?}: {}", url, e))?;
    Ok(Self { client, url })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

#[async_trait]
impl Fetch<Value> for HttpFetch {
  async fn fetch(&self) -> Result<Loaded<Value>> {
    debug!("GET {}", self.url);
    let response = self
      .client
      .get(self.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", self.url, e))?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(Loaded::absent());
    }
    let response = response
      .error_for_status()
      .map_err(|e| eyre!("Origin {} answered with an error: {}", self.url, e))?;

    let expiration = response
      .headers()
      .get(EXPIRES)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_http_date);

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", self.url, e))?;
    let value: Value = serde_json::from_slice(&body)
      .map_err(|e| eyre!("Origin {} returned invalid JSON: {}", self.url, e))?;

    Ok(Loaded::new(Some(value), expiration))
  }
}

/// Parse an HTTP date (`Tue, 02 Jan 2024 03:00:00 GMT`).
fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc2822(text)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}
