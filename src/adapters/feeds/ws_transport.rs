//! WebSocket Transport - tokio-tungstenite `StreamTransport` Adapter
//!
//! Text frames only. Ping/pong is answered inside tungstenite; binary
//! frames that are valid UTF-8 are surfaced as text.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::domain::FeedError;
use crate::ports::{StreamSession, StreamTransport};

/// Opens TLS websocket connections.
pub struct TungsteniteTransport {
    /// Deadline for TCP + TLS + upgrade.
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, FeedError> {
        let connected = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| FeedError::Connection("websocket connect timed out".into()))?;

        match connected {
            Ok((ws, _response)) => Ok(Box::new(TungsteniteSession { ws, closed: false })),
            // Upgrade refused for credential or endpoint reasons; retrying cannot help.
            Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403 | 404) => Err(
                FeedError::AuthRejected(format!("websocket upgrade rejected with HTTP {}", response.status())),
            ),
            Err(e) => Err(FeedError::Connection(e.to_string())),
        }
    }
}

struct TungsteniteSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl StreamSession for TungsteniteSession {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, FeedError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("Skipping non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Peer closed websocket");
                    return None;
                }
                Err(e) => return Some(Err(FeedError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}
