//! Scenario Tests - Supervisor, Connector, Fallback and Aggregator Together
//!
//! Wires one Binance provider the way the binary does, with the
//! websocket and HTTP transports replaced by doubles.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use common::{text, CannedHttp, Connect, ScriptedStream};
use price_feed_aggregator::adapters::feeds::{
    BinanceProtocol, BinanceRest, ConnectorConfig, FeedConnector, FeedSupervisor, ProviderRuntime,
};
use price_feed_aggregator::adapters::http::{CircuitBreakerConfig, ResilientClient};
use price_feed_aggregator::adapters::server::{create_router, ApiState};
use price_feed_aggregator::domain::{CanonicalSymbol, ConnectionState, FeedError, Provider, SymbolMap};
use price_feed_aggregator::usecases::{
    Aggregator, AggregatorConfig, HistoryFetcher, PollingFallback, PriceCache, ProviderFeed,
};

const BTC_TICK: &str = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"50000.00","B":"1.0","a":"50001.00","A":"2.0"}}"#;
const BTC_SNAPSHOT: &str = r#"{"BTCUSDT":{"lastPrice":"50010","priceChangePercent":"0.5"}}"#;

fn btc() -> CanonicalSymbol {
    CanonicalSymbol::new("BTC", "USD")
}

struct Harness {
    supervisor: Arc<FeedSupervisor>,
    aggregator: Arc<Aggregator>,
    client: Arc<ResilientClient>,
    stream: Arc<ScriptedStream>,
    http: Arc<CannedHttp>,
}

fn harness(script: Vec<Connect>, stream_enabled: bool) -> Harness {
    let stream = ScriptedStream::new(script);
    let http = CannedHttp::ok(BTC_SNAPSHOT);
    let client = Arc::new(ResilientClient::new(http.clone(), CircuitBreakerConfig::default()));
    let symbols = SymbolMap::for_provider(Provider::Binance).restricted_to(&[btc()]);

    let supervisor = FeedSupervisor::new();
    let cache = Arc::new(PriceCache::new(Provider::Binance));
    let rest = Arc::new(BinanceRest::new(Arc::clone(&client), "https://api.test", symbols.clone()));

    let connector = Arc::new(
        FeedConnector::new(
            Arc::new(BinanceProtocol::new("wss://stream.test")),
            stream.clone(),
            Arc::clone(&cache),
            symbols,
        )
        .with_config(ConnectorConfig {
            reconnect_delay: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(1),
        })
        .with_fallback_notifier(supervisor.fallback_notifier()),
    );
    let fallback = Arc::new(
        PollingFallback::new(rest.clone(), Arc::clone(&cache)).with_interval(Duration::from_secs(3)),
    );

    let aggregator = Aggregator::new(AggregatorConfig::default())
        .with_crypto_feed(ProviderFeed::new(cache, connector.watch_state()))
        .with_crypto_rest(rest);
    let supervisor = supervisor.with_provider(ProviderRuntime {
        connector,
        fallback: Some(fallback),
        stream_enabled,
    });

    Harness {
        supervisor: Arc::new(supervisor),
        aggregator: Arc::new(aggregator),
        client,
        stream,
        http,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn shutdown(h: &Harness) {
    h.supervisor.stop().await;
    assert_eq!(h.supervisor.outstanding_tasks(), 0);
    assert_eq!(h.stream.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stream_tick_reaches_aggregator() {
    let h = harness(vec![Connect::Open(vec![text(BTC_TICK)])], true);
    h.supervisor.start();
    settle().await;

    let runtime = h.supervisor.runtime(Provider::Binance).unwrap();
    assert_eq!(runtime.connector.state(), ConnectionState::Subscribed);
    assert!(h.supervisor.is_ready().await);

    let quote = h.aggregator.get_price(&btc()).await.unwrap();
    assert_eq!(quote.bid, 50000.0);
    assert_eq!(quote.ask, 50001.0);

    let all = h.aggregator.get_all_prices().await;
    let record = all.find(&btc()).unwrap();
    assert_eq!(record.source, "binance");
    assert_eq!(h.http.calls(), 0);

    shutdown(&h).await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_stream_falls_back_to_rest() {
    let h = harness(
        vec![Connect::Refuse(FeedError::AuthRejected("HTTP 401".into()))],
        true,
    );
    h.supervisor.start();
    settle().await;

    let runtime = h.supervisor.runtime(Provider::Binance).unwrap();
    assert_eq!(runtime.connector.state(), ConnectionState::FallbackActive);
    assert!(runtime.fallback.as_ref().unwrap().is_started());
    assert_eq!(h.stream.connects(), 1);

    let all = h.aggregator.get_all_prices().await;
    let record = all.find(&btc()).unwrap();
    assert_eq!(record.bid, 50010.0);
    assert_eq!(record.change_percent, 0.5);
    assert_eq!(record.source, "binance");

    let quote = h.aggregator.get_price(&btc()).await.unwrap();
    assert_eq!(quote.bid, 50010.0);

    // Polling continues on its interval; the stream is never retried.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(h.stream.connects(), 1);
    assert!(h.http.calls() >= 3);

    shutdown(&h).await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_stream_polls_from_boot() {
    let h = harness(Vec::new(), false);
    h.supervisor.start();
    settle().await;

    assert_eq!(h.stream.connects(), 0);
    let runtime = h.supervisor.runtime(Provider::Binance).unwrap();
    assert_eq!(runtime.connector.state(), ConnectionState::FallbackActive);
    assert_eq!(runtime.cache().get(&btc()).await.unwrap().bid, 50010.0);

    shutdown(&h).await;
}

#[tokio::test(start_paused = true)]
async fn test_status_endpoint_reports_fallback() {
    let h = harness(
        vec![Connect::Refuse(FeedError::AuthRejected("HTTP 403".into()))],
        true,
    );
    h.supervisor.start();
    settle().await;

    let app = create_router(Arc::new(ApiState {
        aggregator: Arc::clone(&h.aggregator),
        supervisor: Arc::clone(&h.supervisor),
        history: Arc::new(HistoryFetcher::new(Vec::new())),
        client: Arc::clone(&h.client),
    }));

    let response = app
        .oneshot(Request::builder().uri("/prices/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

    let provider = &json["providers"][0];
    assert_eq!(provider["provider"], "binance");
    assert_eq!(provider["state"], "fallbackActive");
    assert_eq!(provider["fallbackStarted"], true);
    assert_eq!(json["circuits"][0]["name"], "binance-rest");
    assert_eq!(json["circuits"][0]["state"], "CLOSED");

    shutdown(&h).await;
}
