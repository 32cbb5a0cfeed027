//! Price Feed Aggregator - Entry Point
//!
//! Wires every provider's stream, REST fallback and cache into the
//! aggregator and serves the price API until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config (path from `FEED_CONFIG`, default `config.toml`)
//! 2. Init tracing (JSON structured logging)
//! 3. Create the metrics registry
//! 4. Create the resilient REST client and websocket transport
//! 5. Build per-provider caches, connectors and fallbacks
//! 6. Build the aggregator and history fetcher
//! 7. Start the feed supervisor
//! 8. Serve /prices, /live, /ready and /metrics
//! 9. Wait for SIGINT → stop every feed task

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use price_feed_aggregator::adapters::feeds::{
    BinanceProtocol, BinanceRest, FeedConnector, FeedSupervisor, PolygonProtocol, PolygonRest, ProviderRuntime,
    StreamProtocol, TungsteniteTransport, TwelveDataProtocol, TwelveDataRest,
};
use price_feed_aggregator::adapters::http::{ReqwestTransport, ResilientClient};
use price_feed_aggregator::adapters::metrics::{HealthServer, MetricsRegistry};
use price_feed_aggregator::adapters::server::{create_router, ApiState};
use price_feed_aggregator::config::{self, AppConfig};
use price_feed_aggregator::domain::{Provider, SymbolMap};
use price_feed_aggregator::ports::{CandleSource, SnapshotSource, StreamTransport};
use price_feed_aggregator::usecases::{Aggregator, HistoryFetcher, PollingFallback, PriceCache, ProviderFeed};

/// Shared pieces every provider is built from.
struct Wiring {
    client: Arc<ResilientClient>,
    ws_transport: Arc<dyn StreamTransport>,
    metrics: Arc<MetricsRegistry>,
    fallback_notifier: mpsc::UnboundedSender<Provider>,
}

/// One provider, fully assembled.
struct WiredProvider {
    runtime: ProviderRuntime,
    feed: ProviderFeed,
    symbols: SymbolMap,
    snapshot: Arc<dyn SnapshotSource>,
    candles: Arc<dyn CandleSource>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let config_path = std::env::var("FEED_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = config::loader::load_or_default(&config_path)
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured logging ────────────────────
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level));
    if config.service.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind_address,
        "Starting price feed aggregator"
    );

    // ── 3. Metrics registry ─────────────────────────────────
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to register metrics")?);

    // ── 4. REST client + websocket transport ────────────────
    let http = ReqwestTransport::new().context("Failed to build HTTP client")?;
    let client = Arc::new(
        ResilientClient::new(Arc::new(http), config.resilience.circuit_breaker())
            .with_telemetry(Arc::clone(&metrics) as _),
    );
    let ws_transport: Arc<dyn StreamTransport> =
        Arc::new(TungsteniteTransport::new(config.resilience.connect_timeout()));

    // ── 5. Per-provider caches, connectors and fallbacks ────
    let mut supervisor = FeedSupervisor::new();
    let wiring = Wiring {
        client: Arc::clone(&client),
        ws_transport,
        metrics: Arc::clone(&metrics),
        fallback_notifier: supervisor.fallback_notifier(),
    };

    let mut aggregator = Aggregator::new(config.aggregator.to_aggregator_config())
        .with_telemetry(Arc::clone(&metrics) as _);
    let mut history_sources: Vec<Arc<dyn CandleSource>> = Vec::new();

    // Forex priority follows this order: Polygon ahead of Twelve Data.
    for provider in [Provider::Binance, Provider::Polygon, Provider::TwelveData] {
        let Some(wired) = wire_provider(provider, &config, &wiring) else {
            continue;
        };

        // ── 6. Aggregator inputs ────────────────────────────
        aggregator = aggregator.with_symbols(&wired.symbols);
        aggregator = match provider {
            Provider::Binance => aggregator
                .with_crypto_feed(wired.feed)
                .with_crypto_rest(wired.snapshot),
            Provider::Polygon | Provider::TwelveData => aggregator
                .with_forex_feed(wired.feed)
                .with_forex_rest(wired.snapshot),
        };
        history_sources.push(wired.candles);
        supervisor = supervisor.with_provider(wired.runtime);
    }

    if supervisor.runtimes().is_empty() {
        warn!("No provider enabled, every price request will miss");
    }

    let aggregator = Arc::new(aggregator);
    let history = Arc::new(HistoryFetcher::new(history_sources));
    let supervisor = Arc::new(supervisor);

    // ── 7. Start feed tasks ─────────────────────────────────
    supervisor.start();

    // ── 8. Serve the price API, health and metrics ──────────
    let api = create_router(Arc::new(ApiState {
        aggregator,
        supervisor: Arc::clone(&supervisor),
        history,
        client,
    }))
    .merge(HealthServer::new(Arc::clone(&supervisor)).router())
    .merge(Arc::clone(&metrics).router());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Price API listening");

    // ── 9. Wait for SIGINT → graceful shutdown ──────────────
    axum::serve(listener, api)
        .with_graceful_shutdown(async {
            if signal::ctrl_c().await.is_ok() {
                info!("SIGINT received, initiating graceful shutdown");
            }
        })
        .await
        .context("API server failed")?;

    supervisor.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Assemble one provider. `None` when it is disabled or its API key
/// is missing.
fn wire_provider(provider: Provider, config: &AppConfig, wiring: &Wiring) -> Option<WiredProvider> {
    let section = config.providers.get(provider);
    if !section.enabled {
        info!(provider = %provider, "Provider disabled by configuration");
        return None;
    }

    let api_key = match section.resolve_api_key(provider) {
        Ok(key) => key.unwrap_or_default(),
        Err(var) => {
            warn!(provider = %provider, env = %var, "API key missing, provider disabled");
            return None;
        }
    };

    let symbols = section.symbol_map(provider);
    let symbol_count = symbols.len();
    let mut cache = PriceCache::new(provider);
    if let Some(fraction) = config.aggregator.max_jump_fraction {
        cache = cache.with_jump_filter(fraction);
    }
    let cache = Arc::new(cache);

    let ws_url = section.ws_url(provider);
    let rest_url = section.rest_url(provider);
    let options = config.resilience.call_options(provider);
    let client = Arc::clone(&wiring.client);

    let protocol: Arc<dyn StreamProtocol>;
    let snapshot: Arc<dyn SnapshotSource>;
    let candles: Arc<dyn CandleSource>;
    match provider {
        Provider::Binance => {
            let rest = Arc::new(BinanceRest::new(client, rest_url, symbols.clone()).with_call_options(options));
            protocol = Arc::new(BinanceProtocol::new(ws_url));
            snapshot = rest.clone();
            candles = rest;
        }
        Provider::Polygon => {
            let rest = Arc::new(
                PolygonRest::new(client, rest_url, api_key.clone(), symbols.clone()).with_call_options(options),
            );
            protocol = Arc::new(PolygonProtocol::new(ws_url, api_key));
            snapshot = rest.clone();
            candles = rest;
        }
        Provider::TwelveData => {
            let rest = Arc::new(
                TwelveDataRest::new(client, rest_url, api_key.clone(), symbols.clone()).with_call_options(options),
            );
            protocol = Arc::new(TwelveDataProtocol::new(ws_url, api_key));
            snapshot = rest.clone();
            candles = rest;
        }
    }

    let connector = Arc::new(
        FeedConnector::new(protocol, Arc::clone(&wiring.ws_transport), Arc::clone(&cache), symbols.clone())
            .with_config(config.resilience.connector())
            .with_fallback_notifier(wiring.fallback_notifier.clone())
            .with_telemetry(Arc::clone(&wiring.metrics) as _),
    );
    let fallback = Arc::new(
        PollingFallback::new(Arc::clone(&snapshot), Arc::clone(&cache))
            .with_interval(config.resilience.poll_interval())
            .with_telemetry(Arc::clone(&wiring.metrics) as _),
    );

    info!(
        provider = %provider,
        stream = section.stream_enabled,
        symbols = symbol_count,
        "Provider wired"
    );

    Some(WiredProvider {
        feed: ProviderFeed::new(cache, connector.watch_state()),
        runtime: ProviderRuntime {
            connector,
            fallback: Some(fallback),
            stream_enabled: section.stream_enabled,
        },
        symbols,
        snapshot,
        candles,
    })
}
