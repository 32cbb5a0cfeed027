//! Upstream provider identities.

use serde::{Deserialize, Serialize};

use super::quote::Category;

/// Upstream price providers known to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Crypto exchange stream (bookTicker) with a 24h ticker REST batch.
    Binance,
    /// Paid forex websocket with a login step and REST history.
    Polygon,
    /// Websocket-native forex quotes with a heartbeat requirement.
    TwelveData,
}

impl Provider {
    /// All providers, in aggregation priority order per category.
    pub const ALL: [Provider; 3] = [Provider::Binance, Provider::Polygon, Provider::TwelveData];

    /// Stable lowercase identifier used in logs, metrics and circuit names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Polygon => "polygon",
            Self::TwelveData => "twelvedata",
        }
    }

    /// Instrument category served by this provider.
    pub fn category(&self) -> Category {
        match self {
            Self::Binance => Category::Crypto,
            Self::Polygon | Self::TwelveData => Category::Forex,
        }
    }

    /// Name of the circuit guarding this provider's REST endpoints.
    pub fn rest_circuit(&self) -> String {
        format!("{}-rest", self.as_str())
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
