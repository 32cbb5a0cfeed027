//! Cross-rate derivation through USD legs.
//!
//! `A/B = A_usd / B_usd`, where `X_usd` comes from a direct `X/USD`
//! quote or the inverse of a `USD/X` quote. The synthesized pair gets
//! a fixed spread on top of the derived bid.

use super::quote::CanonicalSymbol;

/// Pivot currency for every derivation.
pub const PIVOT: &str = "USD";

/// A quoted leg as seen by the derivation: reference price plus the
/// session change in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leg {
    pub price: f64,
    pub change_percent: f64,
    pub timestamp_ms: u64,
}

/// Result of a successful derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedCross {
    pub bid: f64,
    pub ask: f64,
    pub change_percent: f64,
    /// Oldest leg timestamp; a cross is only as fresh as its stalest input.
    pub timestamp_ms: u64,
}

/// Value of one unit of `currency` in USD, with its change.
fn usd_value<F>(currency: &str, lookup: &F) -> Option<Leg>
where
    F: Fn(&CanonicalSymbol) -> Option<Leg>,
{
    if currency == PIVOT {
        return Some(Leg {
            price: 1.0,
            change_percent: 0.0,
            timestamp_ms: u64::MAX,
        });
    }
    if let Some(leg) = lookup(&CanonicalSymbol::new(currency, PIVOT)).filter(|l| l.price > 0.0) {
        return Some(leg);
    }
    lookup(&CanonicalSymbol::new(PIVOT, currency))
        .filter(|l| l.price > 0.0)
        .map(|leg| Leg {
            price: 1.0 / leg.price,
            change_percent: invert_change(leg.change_percent),
            timestamp_ms: leg.timestamp_ms,
        })
}

/// Change of `1/x` given the percent change of `x`.
fn invert_change(change_percent: f64) -> f64 {
    let factor = 1.0 + change_percent / 100.0;
    if factor <= 0.0 {
        return 0.0;
    }
    (1.0 / factor - 1.0) * 100.0
}

/// Derive `pair` from USD legs. Returns `None` when either leg is missing,
/// or when the pair has no leg to derive through (`USD/USD`).
pub fn derive<F>(pair: &CanonicalSymbol, spread: f64, lookup: F) -> Option<DerivedCross>
where
    F: Fn(&CanonicalSymbol) -> Option<Leg>,
{
    if pair.base() == pair.quote() {
        return None;
    }
    let base = usd_value(pair.base(), &lookup)?;
    let quote = usd_value(pair.quote(), &lookup)?;

    let bid = base.price / quote.price;
    if !bid.is_finite() || bid <= 0.0 {
        return None;
    }

    let base_factor = 1.0 + base.change_percent / 100.0;
    let quote_factor = 1.0 + quote.change_percent / 100.0;
    let change_percent = if quote_factor > 0.0 {
        (base_factor / quote_factor - 1.0) * 100.0
    } else {
        0.0
    };

    Some(DerivedCross {
        bid,
        ask: bid + spread,
        change_percent,
        timestamp_ms: base.timestamp_ms.min(quote.timestamp_ms),
    })
}
