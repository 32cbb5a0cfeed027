//! Use Cases Layer - Price Ingestion and Aggregation Logic
//!
//! Orchestrates domain types with port interfaces. Nothing in here
//! knows about websockets, reqwest or Prometheus.
//!
//! Use cases:
//! - `PriceCache`: per-provider latest quote per symbol
//! - `PollingFallback`: REST polling for a provider whose stream is gone
//! - `Aggregator`: merged quote table, cross rates, single-flight refresh
//! - `HistoryFetcher`: best-effort OHLC candles

pub mod aggregator;
pub mod history;
pub mod polling_fallback;
pub mod price_cache;

pub use aggregator::{Aggregator, AggregatorConfig, ProviderFeed};
pub use history::HistoryFetcher;
pub use polling_fallback::PollingFallback;
pub use price_cache::{CacheEntry, PriceCache};
