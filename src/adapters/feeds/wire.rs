//! Small decoding helpers shared by the provider adapters.

use serde::Deserialize;

use crate::domain::FeedError;

/// Providers disagree on whether prices are JSON numbers or strings,
/// sometimes within the same payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Num {
    Float(f64),
    Text(String),
}

impl Num {
    /// Finite value, if the field holds one.
    pub fn value(&self) -> Option<f64> {
        let v = match self {
            Num::Float(v) => *v,
            Num::Text(s) => s.trim().parse().ok()?,
        };
        v.is_finite().then_some(v)
    }
}

/// Wall-clock Unix ms, for payloads that carry no timestamp.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn parse_error(provider: &str, e: impl std::fmt::Display) -> FeedError {
    FeedError::Parse(format!("{provider}: {e}"))
}

/// Bid/ask from a payload where the ask may be missing or unusable.
/// A missing ask collapses onto the bid, which downstream reads as
/// "no real ask".
pub fn bid_ask(bid: Option<f64>, ask: Option<f64>, last: Option<f64>) -> Option<(f64, f64)> {
    let bid = bid.filter(|b| *b > 0.0).or(last).filter(|b| *b > 0.0)?;
    let ask = ask.filter(|a| *a > bid).unwrap_or(bid);
    Some((bid, ask))
}
