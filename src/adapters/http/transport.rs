//! Reqwest HTTP Transport - Production `HttpTransport` Adapter
//!
//! Plain GET with a per-request deadline. Retry and circuit logic live
//! in the resilient client, not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::domain::FeedError;
use crate::ports::{HttpResponse, HttpTransport};

/// Pooled reqwest client shared by every provider REST adapter.
pub struct ReqwestTransport {
  /// Underlying HTTP client.
  http: Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self, FeedError> {
    let http = Client::builder()
      .pool_max_idle_per_host(5)
      .user_agent(concat!("price-feed-aggregator/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FeedError::Transport(format!("Failed to build HTTP client: {e}")))?;

    Ok(Self { http })
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, FeedError> {
    let response = self
      .http
      .get(url)
      .timeout(timeout)
      .send()
      .await
      .map_err(|e| map_error(e, timeout))?;

    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| map_error(e, timeout))?;

    Ok(HttpResponse { status, body })
  }
}

/// URLs carry API keys, so they are stripped before the error is
/// surfaced or logged.
fn map_error(e: reqwest::Error, timeout: Duration) -> FeedError {
  if e.is_timeout() {
    FeedError::FetchTimeout(timeout.as_millis() as u64)
  } else {
    FeedError::Transport(e.without_url().to_string())
  }
}
