//! Connector Tests - Stream State Machine Against a Scripted Transport
//!
//! Drives real provider protocols over the scripted websocket double
//! with paused tokio time, so reconnect delays, login deadlines and
//! heartbeats run instantly and deterministically.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mockall::mock;
use mockall::predicate::*;
use tokio::sync::mpsc;

use common::{text, Connect, Inbound, ScriptedStream};
use price_feed_aggregator::adapters::feeds::{
    BinanceProtocol, ConnectorConfig, FeedConnector, PolygonProtocol, StreamProtocol, TwelveDataProtocol,
};
use price_feed_aggregator::domain::{CanonicalSymbol, CircuitState, ConnectionState, FeedError, Provider, SymbolMap};
use price_feed_aggregator::ports::FeedTelemetry;
use price_feed_aggregator::usecases::PriceCache;

// ---- Mock Definitions ----

mock! {
    pub Telemetry {}

    impl FeedTelemetry for Telemetry {
        fn quotes_applied(&self, provider: Provider, path: &'static str, count: u64);
        fn poll_failed(&self, provider: Provider, reason: &'static str);
        fn singleflight_joined(&self, key: &str);
        fn messages_malformed(&self, provider: Provider, count: u64);
        fn symbol_unmapped(&self, provider: Provider);
        fn stream_dropped(&self, provider: Provider);
        fn feed_state(&self, provider: Provider, state: ConnectionState);
        fn http_call(&self, circuit: &str, outcome: &'static str);
        fn circuit_state(&self, circuit: &str, state: CircuitState);
    }
}

const BTC_TICK: &str = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"50000.00","B":"1.0","a":"50001.00","A":"2.0"}}"#;

fn btc() -> CanonicalSymbol {
    CanonicalSymbol::new("BTC", "USD")
}

fn config() -> ConnectorConfig {
    ConnectorConfig {
        reconnect_delay: Duration::from_secs(5),
        auth_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_secs(1),
    }
}

fn connector(
    protocol: Arc<dyn StreamProtocol>,
    stream: &Arc<ScriptedStream>,
    symbols: SymbolMap,
) -> (Arc<FeedConnector>, mpsc::UnboundedReceiver<Provider>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cache = Arc::new(PriceCache::new(protocol.provider()));
    let connector = FeedConnector::new(protocol, stream.clone(), cache, symbols)
        .with_config(config())
        .with_fallback_notifier(tx);
    (Arc::new(connector), rx)
}

fn binance(stream: &Arc<ScriptedStream>) -> (Arc<FeedConnector>, mpsc::UnboundedReceiver<Provider>) {
    let symbols = SymbolMap::for_provider(Provider::Binance).restricted_to(&[btc()]);
    connector(Arc::new(BinanceProtocol::new("wss://stream.test")), stream, symbols)
}

fn polygon(stream: &Arc<ScriptedStream>) -> (Arc<FeedConnector>, mpsc::UnboundedReceiver<Provider>) {
    let symbols = SymbolMap::for_provider(Provider::Polygon).restricted_to(&[CanonicalSymbol::new("EUR", "USD")]);
    connector(Arc::new(PolygonProtocol::new("wss://polygon.test", "KEY")), stream, symbols)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn assert_fully_stopped(connector: &FeedConnector, stream: &ScriptedStream) {
    connector.stop().await;
    assert_eq!(connector.outstanding_tasks(), 0);
    assert_eq!(stream.open_sessions(), 0);
}

// ── Happy path ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stream_tick_lands_in_cache() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![text(BTC_TICK)])]);
    let (connector, _rx) = binance(&stream);

    connector.start();
    settle().await;

    assert_eq!(connector.state(), ConnectionState::Subscribed);
    let quote = connector.cache().get(&btc()).await.unwrap();
    assert_eq!(quote.bid, 50000.0);
    assert_eq!(quote.ask, 50001.0);
    assert_eq!(connector.stats().ticks, 1);
    // Binance encodes subscriptions in the URL.
    assert!(stream.sent().is_empty());

    assert_fully_stopped(&connector, &stream).await;
    assert_eq!(connector.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_newer_tick_replaces_older() {
    let second = BTC_TICK.replace("50000.00", "50100.00").replace("50001.00", "50101.00");
    let stream = ScriptedStream::new(vec![Connect::Open(vec![text(BTC_TICK), text(&second)])]);
    let (connector, _rx) = binance(&stream);

    connector.start();
    settle().await;

    let quote = connector.cache().get(&btc()).await.unwrap();
    assert_eq!(quote.bid, 50100.0);
    assert_eq!(connector.stats().ticks, 2);
    assert_fully_stopped(&connector, &stream).await;
}

// ── Malformed input ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unmapped_frames_are_counted_not_fatal() {
    let unmapped = r#"{"stream":"foousdt@bookTicker","data":{"s":"FOOUSDT","b":"1.0","a":"1.1"}}"#;
    let stream = ScriptedStream::new(vec![Connect::Open(vec![
        text("not json at all"),
        text(r#"{"result":null,"id":1}"#),
        text(unmapped),
        text(BTC_TICK),
    ])]);
    let (connector, _rx) = binance(&stream);

    connector.start();
    settle().await;

    let stats = connector.stats();
    assert_eq!(stats.parse_failures, 1);
    assert_eq!(stats.unmapped_symbols, 1);
    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(connector.state(), ConnectionState::Subscribed);
    assert_eq!(stream.connects(), 1);
    assert_fully_stopped(&connector, &stream).await;
}

#[tokio::test(start_paused = true)]
async fn test_bad_batch_element_counted_rest_applied() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![
        text(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#),
        text(
            r#"[{"ev":"C","p":"EUR/USD","b":1.0850,"t":1},
                {"ev":"C","p":"EUR/USD","a":1.0852,"b":1.0850,"t":2}]"#,
        ),
    ])]);
    let (connector, _rx) = polygon(&stream);

    connector.start();
    settle().await;

    let stats = connector.stats();
    assert_eq!(stats.parse_failures, 1);
    assert_eq!(stats.ticks, 1);
    let quote = connector.cache().get(&CanonicalSymbol::new("EUR", "USD")).await.unwrap();
    assert_eq!(quote.timestamp_ms, 2);
    assert_fully_stopped(&connector, &stream).await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_events_reach_telemetry() {
    let unmapped = r#"{"stream":"foousdt@bookTicker","data":{"s":"FOOUSDT","b":"1.0","a":"1.1"}}"#;
    let stream = ScriptedStream::new(vec![Connect::Open(vec![
        text("not json at all"),
        text(unmapped),
        text(BTC_TICK),
    ])]);

    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut telemetry = MockTelemetry::new();
    let recorded = Arc::clone(&states);
    telemetry
        .expect_feed_state()
        .with(eq(Provider::Binance), always())
        .returning(move |_, state| recorded.lock().unwrap().push(state));
    telemetry
        .expect_messages_malformed()
        .with(eq(Provider::Binance), eq(1u64))
        .times(1)
        .return_const(());
    telemetry
        .expect_symbol_unmapped()
        .with(eq(Provider::Binance))
        .times(1)
        .return_const(());
    telemetry
        .expect_quotes_applied()
        .with(eq(Provider::Binance), eq("stream"), eq(1u64))
        .times(1)
        .return_const(());
    telemetry.expect_stream_dropped().never();

    let symbols = SymbolMap::for_provider(Provider::Binance).restricted_to(&[btc()]);
    let connector = Arc::new(
        FeedConnector::new(
            Arc::new(BinanceProtocol::new("wss://stream.test")),
            stream.clone(),
            Arc::new(PriceCache::new(Provider::Binance)),
            symbols,
        )
        .with_config(config())
        .with_telemetry(Arc::new(telemetry)),
    );

    connector.start();
    settle().await;

    assert!(states.lock().unwrap().contains(&ConnectionState::Subscribed));
    assert_fully_stopped(&connector, &stream).await;
}

// ── Reconnect ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_fixed_delay() {
    let stream = ScriptedStream::new(vec![
        Connect::Open(vec![text(BTC_TICK), Inbound::Close]),
        Connect::Open(Vec::new()),
    ]);
    let (connector, _rx) = binance(&stream);

    connector.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(stream.connects(), 1);
    assert_eq!(connector.state(), ConnectionState::Disconnected);
    // The cache keeps serving the last tick while reconnecting.
    assert!(connector.cache().get(&btc()).await.is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(stream.connects(), 1, "reconnected before the delay elapsed");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stream.connects(), 2);
    assert_eq!(connector.state(), ConnectionState::Subscribed);
    assert_eq!(connector.stats().reconnects, 1);
    assert_eq!(stream.open_sessions(), 1);

    assert_fully_stopped(&connector, &stream).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_transient() {
    let stream = ScriptedStream::new(vec![
        Connect::Refuse(FeedError::Connection("connection refused".into())),
        Connect::Open(Vec::new()),
    ]);
    let (connector, mut rx) = binance(&stream);

    connector.start();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(stream.connects(), 2);
    assert_eq!(connector.state(), ConnectionState::Subscribed);
    assert!(rx.try_recv().is_err());
    assert_fully_stopped(&connector, &stream).await;
}

// ── Login step ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_login_then_subscribe() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![
        text(r#"[{"ev":"status","status":"connected","message":"Connected Successfully"}]"#),
        text(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#),
        text(r#"[{"ev":"C","p":"EUR/USD","a":1.0852,"b":1.0850,"t":1700000000000}]"#),
    ])]);
    let (connector, _rx) = polygon(&stream);

    connector.start();
    settle().await;

    assert_eq!(connector.state(), ConnectionState::Subscribed);
    assert_eq!(
        stream.sent(),
        vec![
            r#"{"action":"auth","params":"KEY"}"#.to_string(),
            r#"{"action":"subscribe","params":"C.EUR/USD"}"#.to_string(),
        ]
    );
    let quote = connector.cache().get(&CanonicalSymbol::new("EUR", "USD")).await.unwrap();
    assert_eq!(quote.bid, 1.0850);
    assert_eq!(quote.timestamp_ms, 1_700_000_000_000);
    assert_fully_stopped(&connector, &stream).await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_enters_fallback_once() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![text(
        r#"[{"ev":"status","status":"auth_failed","message":"authentication failed"}]"#,
    )])]);
    let (connector, mut rx) = polygon(&stream);

    connector.start();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.state(), ConnectionState::FallbackActive);
    assert_eq!(rx.try_recv().unwrap(), Provider::Polygon);
    assert!(rx.try_recv().is_err(), "fallback notified more than once");
    // No reconnect loop after a permanent rejection.
    assert_eq!(stream.connects(), 1);
    assert_eq!(stream.open_sessions(), 0);
    assert_eq!(connector.outstanding_tasks(), 0);

    // Restarting a rejected connector does nothing.
    connector.start();
    settle().await;
    assert_eq!(stream.connects(), 1);
    connector.force_fallback("again");
    assert!(rx.try_recv().is_err());

    connector.stop().await;
    assert_eq!(connector.state(), ConnectionState::FallbackActive);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_refusal_enters_fallback() {
    let stream = ScriptedStream::new(vec![Connect::Refuse(FeedError::AuthRejected("HTTP 401".into()))]);
    let (connector, mut rx) = binance(&stream);

    connector.start();
    settle().await;

    assert_eq!(connector.state(), ConnectionState::FallbackActive);
    assert_eq!(rx.try_recv().unwrap(), Provider::Binance);
    assert_eq!(stream.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_login_verdict_drops_session() {
    let stream = ScriptedStream::new(vec![
        Connect::Open(Vec::new()),
        Connect::Open(vec![text(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#)]),
    ]);
    let (connector, mut rx) = polygon(&stream);

    connector.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.state(), ConnectionState::Authenticating);

    // 10s login deadline + 5s reconnect delay.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(stream.connects(), 2);
    assert_eq!(connector.state(), ConnectionState::Subscribed);
    assert!(rx.try_recv().is_err());
    assert_fully_stopped(&connector, &stream).await;
}

// ── Heartbeat ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeat_sent_while_subscribed() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![text(
        r#"{"event":"price","symbol":"EUR/USD","currency_base":"Euro","price":1.0851,"timestamp":1700000000}"#,
    )])]);
    let symbols = SymbolMap::for_provider(Provider::TwelveData).restricted_to(&[CanonicalSymbol::new("EUR", "USD")]);
    let (connector, _rx) = connector(Arc::new(TwelveDataProtocol::new("wss://td.test", "KEY")), &stream, symbols);

    connector.start();
    tokio::time::sleep(Duration::from_secs(25)).await;

    let sent = stream.sent();
    assert_eq!(sent[0], r#"{"action":"subscribe","params":{"symbols":"EUR/USD"}}"#);
    let heartbeats = sent.iter().filter(|f| f.as_str() == r#"{"action":"heartbeat"}"#).count();
    assert_eq!(heartbeats, 2);
    assert_eq!(connector.outstanding_tasks(), 2);

    let quote = connector.cache().get(&CanonicalSymbol::new("EUR", "USD")).await.unwrap();
    assert_eq!(quote.timestamp_ms, 1_700_000_000_000);

    assert_fully_stopped(&connector, &stream).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    let after = stream.sent().iter().filter(|f| f.as_str() == r#"{"action":"heartbeat"}"#).count();
    assert_eq!(after, 2, "heartbeat kept running after stop");
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reconnect_delay() {
    let stream = ScriptedStream::new(vec![Connect::Open(vec![Inbound::Close])]);
    let (connector, _rx) = binance(&stream);

    connector.start();
    settle().await;
    assert_eq!(connector.state(), ConnectionState::Disconnected);

    assert_fully_stopped(&connector, &stream).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(stream.connects(), 1);
}
