//! Quote and symbol value types.
//!
//! Defines the canonical `BASE/QUOTE` symbol, the immutable quote that
//! providers write into their caches, and the consumer-facing records
//! the aggregator produces on every read.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────
// Canonical symbol
// ────────────────────────────────────────────

/// Internal `BASE/QUOTE` representation, independent of any wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    /// Build a symbol from its two legs. Legs are upper-cased.
    pub fn new(base: &str, quote: &str) -> Self {
        Self(format!(
            "{}/{}",
            base.trim().to_ascii_uppercase(),
            quote.trim().to_ascii_uppercase()
        ))
    }

    /// Parse a user- or config-supplied symbol.
    ///
    /// Accepts `EUR/USD`, `EUR-USD`, `EUR_USD` and the six-letter
    /// compact form `EURUSD`. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some((base, quote)) = raw.split_once(['/', '-', '_']) {
            return Self::from_legs(base, quote);
        }
        if raw.len() == 6 && raw.is_ascii() {
            let (base, quote) = raw.split_at(3);
            return Self::from_legs(base, quote);
        }
        None
    }

    fn from_legs(base: &str, quote: &str) -> Option<Self> {
        let valid = |leg: &str| {
            (2..=10).contains(&leg.len()) && leg.chars().all(|c| c.is_ascii_alphanumeric())
        };
        if valid(base) && valid(quote) {
            Some(Self::new(base, quote))
        } else {
            None
        }
    }

    /// Base currency (left leg).
    pub fn base(&self) -> &str {
        self.0.split_once('/').map(|(b, _)| b).unwrap_or(&self.0)
    }

    /// Quote currency (right leg).
    pub fn quote(&self) -> &str {
        self.0.split_once('/').map(|(_, q)| q).unwrap_or("")
    }

    /// The pair with its legs swapped (`USD/JPY` → `JPY/USD`).
    pub fn inverse(&self) -> Self {
        Self::new(self.quote(), self.base())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalSymbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid symbol '{value}', expected BASE/QUOTE"))
    }
}

impl From<CanonicalSymbol> for String {
    fn from(value: CanonicalSymbol) -> Self {
        value.0
    }
}

// ────────────────────────────────────────────
// Quotes
// ────────────────────────────────────────────

/// Instrument category exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Forex,
    Crypto,
}

/// A bid/ask observation for one symbol.
///
/// Immutable: caches replace the whole value on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: CanonicalSymbol,
    pub bid: f64,
    pub ask: f64,
    /// Provider timestamp (Unix ms).
    pub timestamp_ms: u64,
}

impl Quote {
    pub fn new(symbol: CanonicalSymbol, bid: f64, ask: f64, timestamp_ms: u64) -> Self {
        Self {
            symbol,
            bid,
            ask,
            timestamp_ms,
        }
    }

    /// Whether the provider quoted a distinct ask above the bid.
    ///
    /// Providers that only publish a last/mid price set `ask == bid`.
    pub fn has_real_ask(&self) -> bool {
        self.ask > self.bid
    }

    /// Mid when a real ask exists, otherwise the bid.
    pub fn reference_price(&self) -> f64 {
        if self.has_real_ask() {
            (self.bid + self.ask) / 2.0
        } else {
            self.bid
        }
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Finite, strictly positive bid and ask.
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite() && self.bid > 0.0 && self.ask > 0.0
    }
}

/// Consumer-facing quote record. Derived on every read, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedQuoteRecord {
    pub symbol: CanonicalSymbol,
    pub category: Category,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub change_percent: f64,
    /// Provider id, or `"derived"` for synthesized cross rates.
    pub source: String,
    /// Unix ms of the quote; for derived crosses, the oldest leg.
    pub timestamp: u64,
}

/// Full price surface, split by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllPrices {
    pub forex: Vec<AggregatedQuoteRecord>,
    pub crypto: Vec<AggregatedQuoteRecord>,
}

impl AllPrices {
    /// Find a record by symbol in either category.
    pub fn find(&self, symbol: &CanonicalSymbol) -> Option<&AggregatedQuoteRecord> {
        self.forex
            .iter()
            .chain(self.crypto.iter())
            .find(|r| &r.symbol == symbol)
    }
}

// ────────────────────────────────────────────
// History
// ────────────────────────────────────────────

/// One OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    /// Bar open time (Unix ms).
    pub time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// Supported candle resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl CandleInterval {
    /// Short code, also Binance's kline interval parameter.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::OneMinute => MINUTE,
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::OneHour => 60 * MINUTE,
            Self::FourHours => 240 * MINUTE,
            Self::OneDay => 1_440 * MINUTE,
        }
    }
}

impl std::str::FromStr for CandleInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "1h" => Ok(Self::OneHour),
            "4h" => Ok(Self::FourHours),
            "1d" => Ok(Self::OneDay),
            other => Err(format!("unsupported interval '{other}'")),
        }
    }
}
