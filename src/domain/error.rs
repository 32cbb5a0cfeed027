//! Failure taxonomy for provider I/O.
//!
//! Every provider-level failure is expressed as a [`FeedError`] and
//! absorbed before it reaches the aggregator's public surface.

use thiserror::Error;

/// Errors raised while talking to an upstream price provider.
///
/// `Clone` so a single in-flight REST refresh can hand the same
/// outcome to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Transient stream failure; the connector reconnects.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential or endpoint rejected; the stream path is abandoned.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Payload could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Named circuit is open; no network I/O was attempted.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Request exceeded its deadline.
    #[error("request timed out after {0} ms")]
    FetchTimeout(u64),

    /// Upstream answered with a non-2xx status.
    #[error("upstream returned HTTP {status}")]
    FetchHttp { status: u16 },

    /// Lower-level HTTP transport failure (DNS, TLS, reset).
    #[error("transport error: {0}")]
    Transport(String),
}

impl FeedError {
    /// Whether the stream path must not be retried after this error.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }

    /// Whether the error came from an open circuit rather than the network.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Whether a REST attempt ending in this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchTimeout(_) | Self::FetchHttp { .. } | Self::Transport(_) | Self::Connection(_)
        )
    }

    /// Short class name, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::AuthRejected(_) => "auth_rejected",
            Self::Parse(_) => "parse",
            Self::CircuitOpen(_) => "circuit_open",
            Self::FetchTimeout(_) => "timeout",
            Self::FetchHttp { .. } => "http_status",
            Self::Transport(_) => "transport",
        }
    }
}
