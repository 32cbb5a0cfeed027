//! Best-effort OHLC history across providers.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{Candle, CandleInterval, CanonicalSymbol};
use crate::ports::CandleSource;

/// Bars returned when the caller does not ask for a count.
pub const DEFAULT_LIMIT: usize = 100;
/// Upper bound on a single history request.
pub const MAX_LIMIT: usize = 1000;

/// Routes a history request to the first provider serving the symbol.
pub struct HistoryFetcher {
    /// Priority order.
    sources: Vec<Arc<dyn CandleSource>>,
}

impl HistoryFetcher {
    pub fn new(sources: Vec<Arc<dyn CandleSource>>) -> Self {
        Self { sources }
    }

    pub fn supports(&self, symbol: &CanonicalSymbol) -> bool {
        self.sources.iter().any(|s| s.supports(symbol))
    }

    /// Candles oldest first. Failures yield an empty list, never an error.
    pub async fn fetch(&self, symbol: &CanonicalSymbol, interval: CandleInterval, limit: usize) -> Vec<Candle> {
        let limit = limit.clamp(1, MAX_LIMIT);

        for source in self.sources.iter().filter(|s| s.supports(symbol)) {
            match source.fetch_candles(symbol, interval, limit).await {
                Ok(candles) if !candles.is_empty() => return candles,
                Ok(_) => debug!(provider = %source.provider(), symbol = %symbol, "Empty history"),
                Err(e) => warn!(provider = %source.provider(), symbol = %symbol, error = %e, "History fetch failed"),
            }
        }
        Vec::new()
    }
}
