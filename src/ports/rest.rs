//! Provider REST Ports - Snapshot Quotes and Candle History
//!
//! Implemented once per provider on top of the resilient client.
//! The polling fallback and the aggregator's single-flight refresh
//! both consume `SnapshotSource`; the history fetcher consumes
//! `CandleSource`.

use async_trait::async_trait;

use crate::domain::{Candle, CandleInterval, CanonicalSymbol, FeedError, Provider, Quote};

/// A quote from a REST snapshot, with the provider-reported daily change
/// when the endpoint publishes one.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotQuote {
  pub quote: Quote,
  pub change_percent: Option<f64>,
}

/// Batch "latest prices" endpoint for one provider.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
  /// Provider behind this endpoint.
  fn provider(&self) -> Provider;

  /// Fetch the latest quotes for every subscribed symbol, already
  /// mapped to canonical symbols. Unmapped entries are dropped.
  async fn fetch_snapshot(&self) -> Result<Vec<SnapshotQuote>, FeedError>;
}

/// OHLC history endpoint for one provider.
#[async_trait]
pub trait CandleSource: Send + Sync + 'static {
  fn provider(&self) -> Provider;

  /// Whether this provider can serve history for `symbol`.
  fn supports(&self, symbol: &CanonicalSymbol) -> bool;

  /// Fetch up to `limit` bars, oldest first.
  async fn fetch_candles(
    &self,
    symbol: &CanonicalSymbol,
    interval: CandleInterval,
    limit: usize,
  ) -> Result<Vec<Candle>, FeedError>;
}
