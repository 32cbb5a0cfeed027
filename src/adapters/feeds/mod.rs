//! Market Data Feed Adapters - Real-time Price Streaming
//!
//! Provides websocket price feeds with REST fallbacks from:
//! - Binance: crypto bookTicker stream, 24h ticker snapshot, klines
//! - Polygon: forex quote stream with login step, snapshot, aggregates
//! - Twelve Data: forex price stream with heartbeat, `/price`, `/time_series`
//! - Connector: provider-agnostic connection state machine
//! - Task Supervisor: owns connectors and fallbacks, routes fallback requests

pub mod binance;
pub mod connector;
pub mod polygon;
pub mod task_supervisor;
pub mod twelvedata;
pub mod wire;
pub mod ws_transport;

pub use binance::{BinanceProtocol, BinanceRest};
pub use connector::{
    AuthOutcome, ConnectorConfig, ConnectorStats, Decoded, FeedConnector, Heartbeat, StreamProtocol, WireTick,
};
pub use polygon::{PolygonProtocol, PolygonRest};
pub use task_supervisor::{FeedSupervisor, ProviderRuntime, ProviderStatus};
pub use twelvedata::{TwelveDataProtocol, TwelveDataRest};
pub use ws_transport::TungsteniteTransport;
