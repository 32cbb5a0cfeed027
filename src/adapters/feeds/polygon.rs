//! Polygon Adapter - Forex Quote Stream with Login Step
//!
//! Stream: `auth` frame first; `auth_success` unlocks the `C.*`
//! subscription, `auth_failed` (or a plan/entitlement error) is
//! permanent. Events arrive as JSON arrays tagged by `ev`.
//! REST: forex snapshot tickers and `/v2/aggs` history.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::connector::{AuthOutcome, Decoded, StreamProtocol, WireTick};
use super::wire::{bid_ask, now_ms, parse_error};
use crate::adapters::http::{CallOptions, ResilientClient};
use crate::domain::{Candle, CandleInterval, CanonicalSymbol, FeedError, Provider, Quote, SymbolMap};
use crate::ports::{CandleSource, SnapshotQuote, SnapshotSource};

/// Status messages that mean the key can never stream.
const PERMANENT_MARKERS: &[&str] = &["not authorized", "plan", "entitle", "invalid api key"];

#[derive(Debug, Deserialize)]
#[serde(tag = "ev")]
enum StreamEvent {
    #[serde(rename = "status")]
    Status {
        status: String,
        #[serde(default)]
        message: String,
    },
    /// Forex quote.
    #[serde(rename = "C")]
    Quote {
        /// Pair, e.g. "EUR/USD".
        p: String,
        a: f64,
        b: f64,
        /// Unix ms.
        t: u64,
    },
    #[serde(other)]
    Other,
}

/// Polygon forex websocket dialect.
pub struct PolygonProtocol {
    ws_url: String,
    api_key: String,
}

impl PolygonProtocol {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl StreamProtocol for PolygonProtocol {
    fn provider(&self) -> Provider {
        Provider::Polygon
    }

    fn url(&self, _symbols: &SymbolMap) -> String {
        self.ws_url.clone()
    }

    fn auth_message(&self) -> Option<String> {
        Some(serde_json::json!({ "action": "auth", "params": self.api_key }).to_string())
    }

    fn subscribe_messages(&self, symbols: &SymbolMap) -> Vec<String> {
        let params: Vec<String> = symbols
            .canonical_symbols()
            .iter()
            .map(|s| format!("C.{s}"))
            .collect();
        vec![serde_json::json!({ "action": "subscribe", "params": params.join(",") }).to_string()]
    }

    fn decode(&self, text: &str) -> Result<Decoded, FeedError> {
        // One bad element must not cost the rest of the batch.
        let elements: Vec<serde_json::Value> = serde_json::from_str(text).map_err(|e| parse_error("polygon", e))?;

        let mut decoded = Decoded::nothing();
        for element in elements {
            let event = match serde_json::from_value::<StreamEvent>(element) {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable polygon event");
                    decoded.malformed += 1;
                    continue;
                }
            };
            match event {
                StreamEvent::Status { status, message } => match status.as_str() {
                    "auth_success" => decoded.auth = Some(AuthOutcome::Accepted),
                    "auth_failed" => decoded.auth = Some(AuthOutcome::Rejected(message)),
                    "error" if is_permanent(&message) => decoded.auth = Some(AuthOutcome::Rejected(message)),
                    _ => {}
                },
                StreamEvent::Quote { p, a, b, t } => {
                    if let Some((bid, ask)) = bid_ask(Some(b), Some(a), None) {
                        decoded.ticks.push(WireTick {
                            symbol: p.replace('/', ""),
                            bid,
                            ask,
                            timestamp_ms: t,
                        });
                    }
                }
                StreamEvent::Other => {}
            }
        }
        Ok(decoded)
    }
}

fn is_permanent(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    PERMANENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Deserialize)]
struct LastQuote {
    a: f64,
    b: f64,
    t: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotTicker {
    /// "C:EURUSD"
    ticker: String,
    #[serde(default)]
    todays_change_perc: Option<f64>,
    last_quote: Option<LastQuote>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    tickers: Vec<SnapshotTicker>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: Option<f64>,
    t: i64,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggBar>,
}

/// Polygon REST endpoints behind the resilient client.
pub struct PolygonRest {
    client: Arc<ResilientClient>,
    base_url: String,
    api_key: String,
    symbols: SymbolMap,
    options: CallOptions,
}

impl PolygonRest {
    pub fn new(
        client: Arc<ResilientClient>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        symbols: SymbolMap,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            symbols,
            options: CallOptions::new(Provider::Polygon.rest_circuit()),
        }
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.options = CallOptions {
            circuit: Provider::Polygon.rest_circuit(),
            ..options
        };
        self
    }

    fn to_snapshot(&self, ticker: &SnapshotTicker) -> Option<SnapshotQuote> {
        let wire = ticker.ticker.strip_prefix("C:").unwrap_or(&ticker.ticker);
        let symbol = self.symbols.to_canonical(wire)?.clone();
        let last = ticker.last_quote.as_ref()?;
        let (bid, ask) = bid_ask(Some(last.b), Some(last.a), None)?;
        Some(SnapshotQuote {
            quote: Quote::new(symbol, bid, ask, last.t),
            change_percent: ticker.todays_change_perc,
        })
    }
}

#[async_trait]
impl SnapshotSource for PolygonRest {
    fn provider(&self) -> Provider {
        Provider::Polygon
    }

    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotQuote>, FeedError> {
        let tickers: Vec<String> = self
            .symbols
            .wire_symbols()
            .iter()
            .map(|s| format!("C:{s}"))
            .collect();
        let url = format!(
            "{}/v2/snapshot/locale/global/markets/forex/tickers?tickers={}&apiKey={}",
            self.base_url,
            tickers.join(","),
            self.api_key
        );

        let response: SnapshotResponse = self.client.call(&url, &self.options).await?;
        Ok(response
            .tickers
            .iter()
            .filter_map(|t| self.to_snapshot(t))
            .collect())
    }
}

/// Polygon range parameters: (multiplier, timespan).
fn range_params(interval: CandleInterval) -> (u32, &'static str) {
    match interval {
        CandleInterval::OneMinute => (1, "minute"),
        CandleInterval::FiveMinutes => (5, "minute"),
        CandleInterval::FifteenMinutes => (15, "minute"),
        CandleInterval::OneHour => (1, "hour"),
        CandleInterval::FourHours => (4, "hour"),
        CandleInterval::OneDay => (1, "day"),
    }
}

#[async_trait]
impl CandleSource for PolygonRest {
    fn provider(&self) -> Provider {
        Provider::Polygon
    }

    fn supports(&self, symbol: &CanonicalSymbol) -> bool {
        self.symbols.contains(symbol)
    }

    async fn fetch_candles(
        &self,
        symbol: &CanonicalSymbol,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let wire = self
            .symbols
            .to_wire(symbol)
            .ok_or_else(|| parse_error("polygon", format!("no wire symbol for {symbol}")))?;
        let (multiplier, timespan) = range_params(interval);
        let to = now_ms() as i64;
        let from = to - interval.duration_ms() * limit as i64;
        let url = format!(
            "{}/v2/aggs/ticker/C:{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}&apiKey={}",
            self.base_url, wire, multiplier, timespan, from, to, limit, self.api_key
        );

        let response: AggsResponse = self.client.call(&url, &self.options).await?;
        let skip = response.results.len().saturating_sub(limit);
        Ok(response
            .results
            .into_iter()
            .skip(skip)
            .map(|bar| Candle {
                time_ms: bar.t,
                open: bar.o,
                high: bar.h,
                low: bar.l,
                close: bar.c,
                volume: bar.v,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> PolygonProtocol {
        PolygonProtocol::new("wss://socket.polygon.io/forex", "KEY")
    }

    #[test]
    fn test_login_and_subscribe_frames() {
        let symbols = SymbolMap::for_provider(Provider::Polygon)
            .restricted_to(&[CanonicalSymbol::new("EUR", "USD"), CanonicalSymbol::new("GBP", "USD")]);
        let p = protocol();

        let auth: serde_json::Value = serde_json::from_str(&p.auth_message().unwrap()).unwrap();
        assert_eq!(auth["action"], "auth");
        assert_eq!(auth["params"], "KEY");

        let sub: serde_json::Value = serde_json::from_str(&p.subscribe_messages(&symbols)[0]).unwrap();
        assert_eq!(sub["params"], "C.EUR/USD,C.GBP/USD");
    }

    #[test]
    fn test_decode_auth_verdicts() {
        let p = protocol();
        let ok = p
            .decode(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#)
            .unwrap();
        assert_eq!(ok.auth, Some(AuthOutcome::Accepted));

        let failed = p
            .decode(r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#)
            .unwrap();
        assert!(matches!(failed.auth, Some(AuthOutcome::Rejected(_))));

        let plan = p
            .decode(r#"[{"ev":"status","status":"error","message":"Your plan doesn't include websocket access"}]"#)
            .unwrap();
        assert!(matches!(plan.auth, Some(AuthOutcome::Rejected(_))));

        let connected = p
            .decode(r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#)
            .unwrap();
        assert_eq!(connected, Decoded::nothing());
    }

    #[test]
    fn test_decode_quotes_batch() {
        let decoded = protocol()
            .decode(
                r#"[{"ev":"C","p":"EUR/USD","x":48,"a":1.0852,"b":1.0850,"t":1700000000000},
                    {"ev":"C","p":"GBP/USD","x":48,"a":1.2652,"b":1.2650,"t":1700000000001},
                    {"ev":"XQ","pair":"BTC-USD"}]"#,
            )
            .unwrap();
        assert_eq!(decoded.ticks.len(), 2);
        assert_eq!(decoded.ticks[0].symbol, "EURUSD");
        assert_eq!(decoded.ticks[1].timestamp_ms, 1_700_000_000_001);
    }

    #[test]
    fn test_bad_element_keeps_rest_of_batch() {
        let decoded = protocol()
            .decode(
                r#"[{"ev":"C","p":"EUR/USD","b":1.0850,"t":1700000000000},
                    {"ev":"C","p":"GBP/USD","a":1.2652,"b":1.2650,"t":1700000000001},
                    42]"#,
            )
            .unwrap();
        assert_eq!(decoded.malformed, 2);
        assert_eq!(decoded.ticks.len(), 1);
        assert_eq!(decoded.ticks[0].symbol, "GBPUSD");
    }

    #[test]
    fn test_decode_rejects_non_array() {
        assert!(protocol().decode(r#"{"ev":"C"}"#).is_err());
    }
}
