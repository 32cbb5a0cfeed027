//! Domain layer - Quotes, symbols and failure taxonomy.
//!
//! Pure value types shared by every provider adapter and the aggregator.
//! Nothing in here performs I/O (hexagonal architecture inner ring).

pub mod cross_rate;
pub mod error;
pub mod provider;
pub mod quote;
pub mod state;
pub mod symbols;

// Re-export core types for convenience
pub use error::FeedError;
pub use provider::Provider;
pub use quote::{
    AggregatedQuoteRecord, AllPrices, Candle, CandleInterval, CanonicalSymbol, Category, Quote,
};
pub use state::{CircuitState, ConnectionState};
pub use symbols::SymbolMap;
