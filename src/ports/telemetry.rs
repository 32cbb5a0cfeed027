//! Telemetry Port - Counters and Gauges Reported Across the Service
//!
//! Lets connectors, the resilient client, the poller and the aggregator
//! report events without knowing about Prometheus.

use crate::domain::{CircuitState, ConnectionState, Provider};

pub trait FeedTelemetry: Send + Sync + 'static {
  /// `count` quotes landed in a provider cache via `path` ("stream", "rest").
  fn quotes_applied(&self, provider: Provider, path: &'static str, count: u64);

  /// A fallback poll failed; `reason` is a short error class.
  fn poll_failed(&self, provider: Provider, reason: &'static str);

  /// A caller attached to an already in-flight refresh.
  fn singleflight_joined(&self, key: &str);

  /// `count` inbound stream messages (or batch elements) failed to decode.
  fn messages_malformed(&self, provider: Provider, count: u64);

  /// A tick named a wire symbol with no canonical mapping.
  fn symbol_unmapped(&self, provider: Provider);

  /// An established stream dropped and a reconnect is scheduled.
  fn stream_dropped(&self, provider: Provider);

  /// The connector entered `state`.
  fn feed_state(&self, provider: Provider, state: ConnectionState);

  /// A resilient call finished; `outcome` is "ok", "error" or "circuit_open".
  fn http_call(&self, circuit: &str, outcome: &'static str);

  /// Observed breaker state after a call.
  fn circuit_state(&self, circuit: &str, state: CircuitState);
}
