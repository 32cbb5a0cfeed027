//! Binance Adapter - Crypto bookTicker Stream and REST Snapshot
//!
//! Stream: combined `bookTicker` websocket, symbols encoded in the URL,
//! no login step and no subscribe frames.
//! REST: `/api/v3/ticker/24hr` batch for fallback polling and
//! `/api/v3/klines` for history.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::connector::{Decoded, StreamProtocol, WireTick};
use super::wire::{bid_ask, now_ms, parse_error, Num};
use crate::adapters::http::{CallOptions, ResilientClient};
use crate::domain::{Candle, CandleInterval, CanonicalSymbol, FeedError, Provider, Quote, SymbolMap};
use crate::ports::{CandleSource, SnapshotQuote, SnapshotSource};

/// Max bars Binance returns per klines request.
const MAX_KLINES: usize = 1000;

/// Best bid/ask update.
#[derive(Debug, Deserialize)]
struct BookTicker {
    /// Symbol.
    s: String,
    /// Best bid price.
    b: Num,
    /// Best ask price.
    a: Num,
}

/// Frames seen on the combined stream.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamFrame {
    Combined { data: BookTicker },
    Raw(BookTicker),
    /// Reply to a control request (`{"result":null,"id":1}`).
    Ack { id: serde_json::Value },
}

/// Binance bookTicker stream dialect.
pub struct BinanceProtocol {
    /// Websocket base, e.g. `wss://stream.binance.com:9443`.
    ws_url: String,
}

impl BinanceProtocol {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

impl StreamProtocol for BinanceProtocol {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    fn url(&self, symbols: &SymbolMap) -> String {
        let streams: Vec<String> = symbols
            .wire_symbols()
            .iter()
            .map(|s| format!("{}@bookTicker", s.to_ascii_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.ws_url.trim_end_matches('/'), streams.join("/"))
    }

    fn subscribe_messages(&self, _symbols: &SymbolMap) -> Vec<String> {
        Vec::new()
    }

    fn decode(&self, text: &str) -> Result<Decoded, FeedError> {
        let frame: StreamFrame = serde_json::from_str(text).map_err(|e| parse_error("binance", e))?;
        let ticker = match frame {
            StreamFrame::Combined { data } => data,
            StreamFrame::Raw(ticker) => ticker,
            StreamFrame::Ack { .. } => return Ok(Decoded::nothing()),
        };

        let (bid, ask) = bid_ask(ticker.b.value(), ticker.a.value(), None)
            .ok_or_else(|| parse_error("binance", "bookTicker without a usable bid"))?;

        Ok(Decoded::ticks(vec![WireTick {
            symbol: ticker.s,
            bid,
            ask,
            timestamp_ms: now_ms(),
        }]))
    }
}

/// 24h ticker statistics; only the fields we read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerFields {
    last_price: Num,
    #[serde(default)]
    price_change_percent: Option<Num>,
    #[serde(default)]
    bid_price: Option<Num>,
    #[serde(default)]
    ask_price: Option<Num>,
    #[serde(default)]
    close_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(flatten)]
    fields: TickerFields,
}

/// `/ticker/24hr` answers with a list; some proxies and test doubles
/// key the same objects by symbol.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TickerPayload {
    List(Vec<Ticker24h>),
    Keyed(HashMap<String, TickerFields>),
}

/// Binance REST endpoints behind the resilient client.
pub struct BinanceRest {
    client: Arc<ResilientClient>,
    /// REST base, e.g. `https://api.binance.com`.
    base_url: String,
    symbols: SymbolMap,
    options: CallOptions,
}

impl BinanceRest {
    pub fn new(client: Arc<ResilientClient>, base_url: impl Into<String>, symbols: SymbolMap) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            symbols,
            options: CallOptions::new(Provider::Binance.rest_circuit()),
        }
    }

    pub fn with_call_options(mut self, options: CallOptions) -> Self {
        self.options = CallOptions {
            circuit: Provider::Binance.rest_circuit(),
            ..options
        };
        self
    }

    fn snapshot_url(&self) -> String {
        let quoted: Vec<String> = self
            .symbols
            .wire_symbols()
            .iter()
            .map(|s| format!("%22{s}%22"))
            .collect();
        format!("{}/api/v3/ticker/24hr?symbols=%5B{}%5D", self.base_url, quoted.join("%2C"))
    }
}

fn to_snapshot(symbols: &SymbolMap, wire: &str, fields: &TickerFields) -> Option<SnapshotQuote> {
    let symbol = symbols.to_canonical(wire)?.clone();
    let (bid, ask) = bid_ask(
        fields.bid_price.as_ref().and_then(Num::value),
        fields.ask_price.as_ref().and_then(Num::value),
        fields.last_price.value(),
    )?;
    Some(SnapshotQuote {
        quote: Quote::new(symbol, bid, ask, fields.close_time.unwrap_or_else(now_ms)),
        change_percent: fields.price_change_percent.as_ref().and_then(Num::value),
    })
}

#[async_trait]
impl SnapshotSource for BinanceRest {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    async fn fetch_snapshot(&self) -> Result<Vec<SnapshotQuote>, FeedError> {
        let payload: TickerPayload = self.client.call(&self.snapshot_url(), &self.options).await?;

        let quotes = match payload {
            TickerPayload::List(tickers) => tickers
                .iter()
                .filter_map(|t| to_snapshot(&self.symbols, &t.symbol, &t.fields))
                .collect(),
            TickerPayload::Keyed(tickers) => tickers
                .iter()
                .filter_map(|(wire, fields)| to_snapshot(&self.symbols, wire, fields))
                .collect(),
        };
        Ok(quotes)
    }
}

#[async_trait]
impl CandleSource for BinanceRest {
    fn provider(&self) -> Provider {
        Provider::Binance
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
            .ok_or_else(|| parse_error("binance", format!("no wire symbol for {symbol}")))?;
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            wire,
            interval.code(),
            limit.clamp(1, MAX_KLINES)
        );

        // [openTime, open, high, low, close, volume, closeTime, ...]
        let rows: Vec<Vec<serde_json::Value>> = self.client.call(&url, &self.options).await?;
        Ok(rows.iter().filter_map(|row| kline_to_candle(row)).collect())
    }
}

fn kline_to_candle(row: &[serde_json::Value]) -> Option<Candle> {
    let num = |i: usize| -> Option<f64> {
        let v = row.get(i)?;
        v.as_f64().or_else(|| v.as_str()?.parse().ok())
    };
    Some(Candle {
        time_ms: row.first()?.as_i64()?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolMap {
        SymbolMap::for_provider(Provider::Binance).restricted_to(&[
            CanonicalSymbol::new("BTC", "USD"),
            CanonicalSymbol::new("ETH", "USD"),
        ])
    }

    #[test]
    fn test_stream_url_lists_book_tickers() {
        let protocol = BinanceProtocol::new("wss://stream.binance.com:9443/");
        assert_eq!(
            protocol.url(&symbols()),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/ethusdt@bookTicker"
        );
        assert!(protocol.subscribe_messages(&symbols()).is_empty());
        assert!(protocol.auth_message().is_none());
    }

    #[test]
    fn test_decode_combined_book_ticker() {
        let protocol = BinanceProtocol::new("wss://x");
        let decoded = protocol
            .decode(r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"50000.10","B":"1","a":"50000.20","A":"2"}}"#)
            .unwrap();
        assert_eq!(decoded.ticks.len(), 1);
        assert_eq!(decoded.ticks[0].symbol, "BTCUSDT");
        assert_eq!(decoded.ticks[0].bid, 50000.10);
        assert_eq!(decoded.ticks[0].ask, 50000.20);
    }

    #[test]
    fn test_decode_ack_and_garbage() {
        let protocol = BinanceProtocol::new("wss://x");
        assert_eq!(protocol.decode(r#"{"result":null,"id":1}"#).unwrap(), Decoded::nothing());
        assert!(matches!(protocol.decode("not json"), Err(FeedError::Parse(_))));
        assert!(protocol.decode(r#"{"data":{"s":"BTCUSDT","b":"x","a":"1"}}"#).is_err());
    }

    #[test]
    fn test_keyed_ticker_payload() {
        let payload: TickerPayload =
            serde_json::from_str(r#"{"BTCUSDT":{"lastPrice":"50010","priceChangePercent":"0.5"}}"#).unwrap();
        let TickerPayload::Keyed(map) = payload else {
            panic!("expected keyed payload");
        };
        let snap = to_snapshot(&symbols(), "BTCUSDT", &map["BTCUSDT"]).unwrap();
        assert_eq!(snap.quote.symbol, CanonicalSymbol::new("BTC", "USD"));
        assert_eq!(snap.quote.bid, 50010.0);
        assert!(!snap.quote.has_real_ask());
        assert_eq!(snap.change_percent, Some(0.5));
    }

    #[test]
    fn test_kline_row() {
        let row: Vec<serde_json::Value> =
            serde_json::from_str(r#"[1700000000000,"1.0","2.0","0.5","1.5","100",1700000059999]"#).unwrap();
        let candle = kline_to_candle(&row).unwrap();
        assert_eq!(candle.time_ms, 1_700_000_000_000);
        assert_eq!(candle.high, 2.0);
        assert_eq!(candle.volume, Some(100.0));
    }
}
