//! Twelve Data Adapter - Websocket-Native Forex Prices
//!
//! Stream: key in the connect URL, one subscribe frame, and a
//! `{"action":"heartbeat"}` keep-alive every 10s while subscribed.
//! Price events carry a single price (bid/ask only on some plans).
//! REST: `/price` batch and `/time_series` history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;

use super::connector::{AuthOutcome, Decoded, Heartbeat, StreamProtocol, WireTick};
use super::wire::{bid_ask, now_ms, parse_error, Num};
use crate::adapters::http::{CallOptions, ResilientClient};
use crate::domain::{Candle, CandleInterval, CanonicalSymbol, FeedError, Provider, Quote, SymbolMap};
use crate::ports::{CandleSource, SnapshotQuote, SnapshotSource};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const MAX_OUTPUT_SIZE: usize = 5000;

/// Every frame Twelve Data sends shares this loose shape.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    price: Option<Num>,
    #[serde(default)]
    bid: Option<Num>,
    #[serde(default)]
    ask: Option<Num>,
    /// Unix seconds.
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// Twelve Data quotes websocket dialect.
pub struct TwelveDataProtocol {
    ws_url: String,
    api_key: String,
}

impl TwelveDataProtocol {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl StreamProtocol for TwelveDataProtocol {
    fn provider(&self) -> Provider {
        Provider::TwelveData
    }

    fn url(&self, _symbols: &SymbolMap) -> String {
        format!("{}?apikey={}", self.ws_url, self.api_key)
    }

    fn subscribe_messages(&self, symbols: &SymbolMap) -> Vec<String> {
        let wires = symbols.wire_symbols().join(",");
        vec![serde_json::json!({ "action": "subscribe", "params": { "symbols": wires } }).to_string()]
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        Some(Heartbeat {
            interval: HEARTBEAT_INTERVAL,
            message: r#"{"action":"heartbeat"}"#.to_string(),
        })
    }

    fn decode(&self, text: &str) -> Result<Decoded, FeedError> {
        let frame: StreamFrame = serde_json::from_str(text).map_err(|e| parse_error("twelvedata", e))?;

        if frame.status.as_deref() == Some("error") && frame.event.as_deref() != Some("subscribe-status") {
            let message = frame.message.unwrap_or_default();
            let lower = message.to_ascii_lowercase();
            if matches!(frame.code, Some(401 | 403)) || lower.contains("apikey") || lower.contains("api key") {
                return Ok(Decoded::auth(AuthOutcome::Rejected(message)));
            }
            return Ok(Decoded::nothing());
        }

        match frame.event.as_deref() {
            Some("price") => {
                let symbol = frame
                    .symbol
                    .ok_or_else(|| parse_error("twelvedata", "price event without symbol"))?;
                let last = frame.price.as_ref().and_then(Num::value);
                let (bid, ask) = bid_ask(
                    frame.bid.as_ref().and_then(Num::value),
                    frame.ask.as_ref().and_then(Num::value),
                    last,
                )
                .ok_or_else(|| parse_error("twelvedata", "price event without a usable price"))?;

                Ok(Decoded::ticks(vec![WireTick {
                    symbol,
                    bid,
                    ask,
                    timestamp_ms: frame.timestamp.map(|s| s * 1000).unwrap_or_else(now_ms),
                }]))
            }
            Some(_) => Ok(Decoded::nothing()),
            None => Err(parse_error("twelvedata", "frame without event")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceField {
    #[serde(default)]
    price: Option<Num>,
}

/// `/price` returns a bare object for one symbol and a symbol-keyed
/// map for several.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PricePayload {
    Single { price: Num },
    Batch(HashMap<String, PriceField>),
}

#[derive(Debug, Deserialize)]
struct SeriesValue {
    datetime: String,
    open: Num,
    high: Num,
    low: Num,
    close: Num,
    #[serde(default)]
    volume: Option<Num>,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    values: Vec<SeriesValue>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Twelve Data REST endpoints behind the resilient client.
pub struct TwelveDataRest {
    client: Arc<ResilientClient>,
    base_url: String,
    api_key: String,
    symbols: SymbolMap,
    options: CallOptions,
}

impl TwelveDataRest {
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
            options: CallOptions::new(Provider::TwelveData.rest_circuit()),
        }
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.options = CallOptions {
            circuit: Provider::TwelveData.rest_circuit(),
            ..options
        };
        self
    }

    fn to_snapshot(&self, wire: &str, price: Option<f64>) -> Option<SnapshotQuote> {
        let symbol = self.symbols.to_canonical(wire)?.clone();
        let (bid, ask) = bid_ask(None, None, price)?;
        Some(SnapshotQuote {
            quote: Quote::new(symbol, bid, ask, now_ms()),
            change_percent: None,
        })
    }
}

#[async_trait]
impl SnapshotSource for TwelveDataRest {
    fn provider(&self) -> Provider {
        Provider::TwelveData
    }

    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotQuote>, FeedError> {
        let wires = self.symbols.wire_symbols();
        let url = format!("{}/price?symbol={}&apikey={}", self.base_url, wires.join(","), self.api_key);

        let payload: PricePayload = self.client.call(&url, &self.options).await?;
        let quotes = match payload {
            PricePayload::Single { price } => wires
                .first()
                .and_then(|wire| self.to_snapshot(wire, price.value()))
                .into_iter()
                .collect(),
            PricePayload::Batch(prices) => prices
                .iter()
                .filter_map(|(wire, field)| self.to_snapshot(wire, field.price.as_ref().and_then(Num::value)))
                .collect(),
        };
        Ok(quotes)
    }
}

fn series_interval(interval: CandleInterval) -> &'static str {
    match interval {
        CandleInterval::OneMinute => "1min",
        CandleInterval::FiveMinutes => "5min",
        CandleInterval::FifteenMinutes => "15min",
        CandleInterval::OneHour => "1h",
        CandleInterval::FourHours => "4h",
        CandleInterval::OneDay => "1day",
    }
}

/// "2024-01-02 15:04:00" intraday, "2024-01-02" daily; both UTC.
fn parse_datetime(raw: &str) -> Option<i64> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn series_to_candle(value: &SeriesValue) -> Option<Candle> {
    Some(Candle {
        time_ms: parse_datetime(&value.datetime)?,
        open: value.open.value()?,
        high: value.high.value()?,
        low: value.low.value()?,
        close: value.close.value()?,
        volume: value.volume.as_ref().and_then(Num::value),
    })
}

#[async_trait]
impl CandleSource for TwelveDataRest {
    fn provider(&self) -> Provider {
        Provider::TwelveData
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
            .ok_or_else(|| parse_error("twelvedata", format!("no wire symbol for {symbol}")))?;
        let url = format!(
            "{}/time_series?symbol={}&interval={}&outputsize={}&timezone=UTC&apikey={}",
            self.base_url,
            wire,
            series_interval(interval),
            limit.clamp(1, MAX_OUTPUT_SIZE),
            self.api_key
        );

        let response: SeriesResponse = self.client.call(&url, &self.options).await?;
        if response.status.as_deref() == Some("error") {
            return Err(parse_error("twelvedata", response.message.unwrap_or_default()));
        }

        // Newest first on the wire.
        let mut candles: Vec<Candle> = response.values.iter().filter_map(series_to_candle).collect();
        candles.reverse();
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> TwelveDataProtocol {
        TwelveDataProtocol::new("wss://ws.twelvedata.com/v1/quotes/price", "KEY")
    }

    #[test]
    fn test_url_subscribe_and_heartbeat() {
        let p = protocol();
        let symbols = SymbolMap::for_provider(Provider::TwelveData)
            .restricted_to(&[CanonicalSymbol::new("EUR", "USD"), CanonicalSymbol::new("USD", "JPY")]);

        assert_eq!(p.url(&symbols), "wss://ws.twelvedata.com/v1/quotes/price?apikey=KEY");
        let sub: serde_json::Value = serde_json::from_str(&p.subscribe_messages(&symbols)[0]).unwrap();
        assert_eq!(sub["params"]["symbols"], "EUR/USD,USD/JPY");

        let hb = p.heartbeat().unwrap();
        assert_eq!(hb.interval, Duration::from_secs(10));
        assert_eq!(hb.message, r#"{"action":"heartbeat"}"#);
    }

    #[test]
    fn test_decode_price_event() {
        let decoded = protocol()
            .decode(r#"{"event":"price","symbol":"EUR/USD","currency_base":"Euro","timestamp":1700000000,"price":1.085}"#)
            .unwrap();
        let tick = &decoded.ticks[0];
        assert_eq!(tick.symbol, "EUR/USD");
        assert_eq!(tick.bid, 1.085);
        assert_eq!(tick.ask, 1.085);
        assert_eq!(tick.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_decode_status_frames() {
        let p = protocol();
        assert_eq!(
            p.decode(r#"{"event":"heartbeat","status":"ok"}"#).unwrap(),
            Decoded::nothing()
        );
        assert_eq!(
            p.decode(r#"{"event":"subscribe-status","status":"ok","success":[],"fails":[]}"#)
                .unwrap(),
            Decoded::nothing()
        );

        let rejected = p
            .decode(r#"{"status":"error","code":401,"message":"**apikey** parameter is incorrect"}"#)
            .unwrap();
        assert!(matches!(rejected.auth, Some(AuthOutcome::Rejected(_))));

        assert!(p.decode(r#"{"event":"price","price":1.0}"#).is_err());
        assert!(p.decode("[]").is_err());
    }

    #[test]
    fn test_price_payload_shapes() {
        let single: PricePayload = serde_json::from_str(r#"{"price":"1.08500"}"#).unwrap();
        assert!(matches!(single, PricePayload::Single { .. }));

        let batch: PricePayload =
            serde_json::from_str(r#"{"EUR/USD":{"price":"1.085"},"GBP/USD":{"price":"1.265"}}"#).unwrap();
        let PricePayload::Batch(map) = batch else {
            panic!("expected batch payload");
        };
        assert_eq!(map["GBP/USD"].price.as_ref().and_then(Num::value), Some(1.265));
    }

    #[test]
    fn test_parse_datetime_forms() {
        assert_eq!(parse_datetime("1970-01-01 00:01:00"), Some(60_000));
        assert_eq!(parse_datetime("1970-01-02"), Some(86_400_000));
        assert_eq!(parse_datetime("yesterday"), None);
    }
}
