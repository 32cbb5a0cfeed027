//! Stream Transport Port - Persistent Text-Frame Connections
//!
//! Abstracts the websocket so connector state machines can be driven
//! by scripted sessions in tests.

use async_trait::async_trait;

use crate::domain::FeedError;

/// One open streaming connection.
#[async_trait]
pub trait StreamSession: Send {
  /// Send a text frame.
  async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

  /// Next inbound text frame. `None` once the peer closed the stream.
  /// Control frames (ping/pong) are handled inside the session.
  async fn next_text(&mut self) -> Option<Result<String, FeedError>>;

  /// Close the connection. Safe to call more than once.
  async fn close(&mut self);
}

/// Opens streaming connections.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
  /// Connect to `url`. A handshake refused for credential or endpoint
  /// reasons must be reported as `FeedError::AuthRejected`.
  async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, FeedError>;
}
