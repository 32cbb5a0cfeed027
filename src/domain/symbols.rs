//! Static wire ↔ canonical symbol tables.
//!
//! Each provider speaks its own symbol dialect (`BTCUSDT`, `EURUSD`,
//! `EUR/USD`). A [`SymbolMap`] converts both ways. Adding an instrument
//! means adding it here AND to the provider's subscription list; a
//! symbol present in only one of the two is silently absent.

use std::collections::HashMap;

use super::provider::Provider;
use super::quote::CanonicalSymbol;

const BINANCE_PAIRS: &[(&str, &str)] = &[
    ("BTCUSDT", "BTC/USD"),
    ("ETHUSDT", "ETH/USD"),
    ("BNBUSDT", "BNB/USD"),
    ("SOLUSDT", "SOL/USD"),
    ("XRPUSDT", "XRP/USD"),
    ("ADAUSDT", "ADA/USD"),
    ("DOGEUSDT", "DOGE/USD"),
    ("AVAXUSDT", "AVAX/USD"),
    ("DOTUSDT", "DOT/USD"),
    ("LTCUSDT", "LTC/USD"),
    ("LINKUSDT", "LINK/USD"),
];

const POLYGON_PAIRS: &[(&str, &str)] = &[
    ("EURUSD", "EUR/USD"),
    ("GBPUSD", "GBP/USD"),
    ("USDJPY", "USD/JPY"),
    ("USDCHF", "USD/CHF"),
    ("AUDUSD", "AUD/USD"),
    ("USDCAD", "USD/CAD"),
    ("NZDUSD", "NZD/USD"),
    ("EURGBP", "EUR/GBP"),
    ("EURJPY", "EUR/JPY"),
    ("GBPJPY", "GBP/JPY"),
];

const TWELVEDATA_PAIRS: &[(&str, &str)] = &[
    ("EUR/USD", "EUR/USD"),
    ("GBP/USD", "GBP/USD"),
    ("USD/JPY", "USD/JPY"),
    ("USD/CHF", "USD/CHF"),
    ("AUD/USD", "AUD/USD"),
    ("USD/CAD", "USD/CAD"),
    ("NZD/USD", "NZD/USD"),
];

/// Bidirectional symbol table for one provider.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    to_canonical: HashMap<String, CanonicalSymbol>,
    to_wire: HashMap<CanonicalSymbol, String>,
    /// Canonical symbols in table order (for stable subscription frames).
    order: Vec<CanonicalSymbol>,
}

impl SymbolMap {
    /// Build from `(wire, canonical)` pairs. Entries whose canonical side
    /// does not parse, or that repeat an already-mapped side, are skipped.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = Self::default();
        for (wire, canonical) in pairs {
            let Some(canonical) = CanonicalSymbol::parse(canonical) else {
                continue;
            };
            let wire = wire.trim().to_ascii_uppercase();
            if map.to_canonical.contains_key(&wire) || map.to_wire.contains_key(&canonical) {
                continue;
            }
            map.to_canonical.insert(wire.clone(), canonical.clone());
            map.to_wire.insert(canonical.clone(), wire);
            map.order.push(canonical);
        }
        map
    }

    /// Built-in table for a provider.
    pub fn for_provider(provider: Provider) -> Self {
        let pairs = match provider {
            Provider::Binance => BINANCE_PAIRS,
            Provider::Polygon => POLYGON_PAIRS,
            Provider::TwelveData => TWELVEDATA_PAIRS,
        };
        Self::from_pairs(pairs.iter().copied())
    }

    /// Keep only the entries whose canonical symbol is in `subscribed`.
    ///
    /// Subscribed symbols missing from the table are dropped here, so a
    /// half-configured instrument ends up absent instead of failing.
    pub fn restricted_to(&self, subscribed: &[CanonicalSymbol]) -> Self {
        if subscribed.is_empty() {
            return self.clone();
        }
        Self::from_pairs(
            self.order
                .iter()
                .filter(|c| subscribed.contains(c))
                .filter_map(|c| self.to_wire.get(c).map(|w| (w.as_str(), c.as_str()))),
        )
    }

    /// Wire → canonical. Case-insensitive on the wire side.
    pub fn to_canonical(&self, wire: &str) -> Option<&CanonicalSymbol> {
        match self.to_canonical.get(wire) {
            Some(found) => Some(found),
            None => self.to_canonical.get(&wire.trim().to_ascii_uppercase()),
        }
    }

    /// Canonical → wire.
    pub fn to_wire(&self, canonical: &CanonicalSymbol) -> Option<&str> {
        self.to_wire.get(canonical).map(String::as_str)
    }

    pub fn contains(&self, canonical: &CanonicalSymbol) -> bool {
        self.to_wire.contains_key(canonical)
    }

    /// Canonical symbols in table order.
    pub fn canonical_symbols(&self) -> &[CanonicalSymbol] {
        &self.order
    }

    /// Wire symbols in table order.
    pub fn wire_symbols(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter_map(|c| self.to_wire(c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_round_trip() {
        for provider in Provider::ALL {
            let map = SymbolMap::for_provider(provider);
            assert!(!map.is_empty(), "{provider} table is empty");
            for canonical in map.canonical_symbols() {
                let wire = map.to_wire(canonical).unwrap();
                assert_eq!(map.to_canonical(wire), Some(canonical));
            }
        }
    }

    #[test]
    fn test_binance_usdt_maps_to_usd() {
        let map = SymbolMap::for_provider(Provider::Binance);
        assert_eq!(map.to_canonical("BTCUSDT").unwrap().as_str(), "BTC/USD");
        assert_eq!(map.to_canonical("btcusdt").unwrap().as_str(), "BTC/USD");
        assert_eq!(map.to_canonical("FOOUSDT"), None);
    }

    #[test]
    fn test_restriction_drops_unmapped_subscriptions() {
        let map = SymbolMap::for_provider(Provider::Polygon);
        let subscribed = vec![
            CanonicalSymbol::new("EUR", "USD"),
            CanonicalSymbol::new("XAU", "USD"), // subscribed but not in the table
        ];
        let restricted = map.restricted_to(&subscribed);
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted.wire_symbols(), vec!["EURUSD"]);
    }

    #[test]
    fn test_duplicate_entries_are_skipped() {
        let map = SymbolMap::from_pairs([("AAA", "EUR/USD"), ("BBB", "EUR/USD"), ("AAA", "GBP/USD")]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.to_wire(&CanonicalSymbol::new("EUR", "USD")), Some("AAA"));
    }
}
