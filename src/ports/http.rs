//! HTTP Transport Port - Single Request Execution
//!
//! The resilient client layers timeout, retry and circuit breaking on
//! top of this trait, so implementations only perform one GET.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::FeedError;

/// Raw HTTP response: status code plus body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: String,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Executes one HTTP GET.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
  /// Issue a GET. Non-2xx statuses are returned as `Ok`; only transport
  /// level failures (connect, TLS, timeout) are `Err`.
  async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, FeedError>;
}
