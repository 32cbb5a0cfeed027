//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) the connectors, pollers and the
//! aggregator need from the outside world. Adapters implement these
//! traits; tests substitute doubles.
//!
//! Port categories:
//! - `HttpTransport`: one-shot HTTP GET used under the resilient client
//! - `StreamTransport`: persistent text-frame streams (websockets)
//! - `SnapshotSource` / `CandleSource`: provider REST snapshots and history
//! - `FeedTelemetry`: counters and gauges reported by adapters and use cases

pub mod http;
pub mod rest;
pub mod stream;
pub mod telemetry;

pub use http::{HttpResponse, HttpTransport};
pub use rest::{CandleSource, SnapshotQuote, SnapshotSource};
pub use stream::{StreamSession, StreamTransport};
pub use telemetry::FeedTelemetry;
