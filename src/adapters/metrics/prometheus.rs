//! Prometheus Metrics Registry - Feed Observability
//!
//! Registers and exposes Prometheus metrics on `/metrics` for Grafana
//! dashboards. Covers connection state, tick throughput, dropped
//! messages, REST fallback failures and circuit breaker state.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::domain::{CircuitState, ConnectionState, Provider};
use crate::ports::FeedTelemetry;

/// Centralized Prometheus metrics for the price feed service.
///
/// All metrics follow the naming convention `price_feed_*` and carry a
/// `provider` (or `circuit`/`key`) label.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Connector state per provider (see `ConnectionState::as_gauge`).
    pub feed_state: IntGaugeVec,
    /// Quotes written into provider caches.
    pub ticks: IntCounterVec,
    /// Inbound messages dropped because they failed to decode.
    pub parse_failures: IntCounterVec,
    /// Ticks dropped because the wire symbol had no canonical mapping.
    pub unmapped_symbols: IntCounterVec,
    /// Stream reconnect attempts.
    pub reconnects: IntCounterVec,
    /// Failed REST fallback polls.
    pub poll_failures: IntCounterVec,
    /// Resilient client calls by outcome (ok, error, circuit_open).
    pub http_requests: IntCounterVec,
    /// Circuit state per named circuit (0 closed, 1 half-open, 2 open).
    pub circuit_state: IntGaugeVec,
    /// Callers that attached to an already in-flight refresh.
    pub singleflight_joins: IntCounterVec,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let feed_state = IntGaugeVec::new(
            Opts::new(
                "price_feed_connection_state",
                "Connector state (0=disconnected .. 4=subscribed, 5=fallback)",
            ),
            &["provider"],
        )?;

        let ticks = IntCounterVec::new(
            Opts::new("price_feed_ticks_total", "Quotes applied to provider caches"),
            &["provider", "path"],
        )?;

        let parse_failures = IntCounterVec::new(
            Opts::new(
                "price_feed_parse_failures_total",
                "Inbound stream messages dropped as malformed",
            ),
            &["provider"],
        )?;

        let unmapped_symbols = IntCounterVec::new(
            Opts::new(
                "price_feed_unmapped_symbols_total",
                "Ticks dropped for unknown wire symbols",
            ),
            &["provider"],
        )?;

        let reconnects = IntCounterVec::new(
            Opts::new("price_feed_reconnects_total", "Stream reconnect attempts"),
            &["provider"],
        )?;

        let poll_failures = IntCounterVec::new(
            Opts::new(
                "price_feed_poll_failures_total",
                "Failed REST fallback polls",
            ),
            &["provider", "reason"],
        )?;

        let http_requests = IntCounterVec::new(
            Opts::new(
                "price_feed_http_requests_total",
                "Resilient client calls by outcome",
            ),
            &["circuit", "outcome"],
        )?;

        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "price_feed_circuit_state",
                "Circuit state (0=closed, 1=half-open, 2=open)",
            ),
            &["circuit"],
        )?;

        let singleflight_joins = IntCounterVec::new(
            Opts::new(
                "price_feed_singleflight_joins_total",
                "Callers served by an already in-flight refresh",
            ),
            &["key"],
        )?;

        // Register all metrics
        registry.register(Box::new(feed_state.clone()))?;
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(parse_failures.clone()))?;
        registry.register(Box::new(unmapped_symbols.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(poll_failures.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(singleflight_joins.clone()))?;

        Ok(Self {
            registry,
            feed_state,
            ticks,
            parse_failures,
            unmapped_symbols,
            reconnects,
            poll_failures,
            http_requests,
            circuit_state,
            singleflight_joins,
        })
    }

    pub fn set_feed_state(&self, provider: Provider, state: ConnectionState) {
        self.feed_state
            .with_label_values(&[provider.as_str()])
            .set(state.as_gauge());
    }

    pub fn set_circuit_state(&self, circuit: &str, state: CircuitState) {
        self.circuit_state
            .with_label_values(&[circuit])
            .set(state.as_gauge());
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// `/metrics` route, merged into the main API router.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&self);
                async move {
                    match metrics.encode() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        )
    }
}

impl FeedTelemetry for MetricsRegistry {
    fn quotes_applied(&self, provider: Provider, path: &'static str, count: u64) {
        self.ticks
            .with_label_values(&[provider.as_str(), path])
            .inc_by(count);
    }

    fn poll_failed(&self, provider: Provider, reason: &'static str) {
        self.poll_failures
            .with_label_values(&[provider.as_str(), reason])
            .inc();
    }

    fn singleflight_joined(&self, key: &str) {
        self.singleflight_joins.with_label_values(&[key]).inc();
    }

    fn messages_malformed(&self, provider: Provider, count: u64) {
        self.parse_failures
            .with_label_values(&[provider.as_str()])
            .inc_by(count);
    }

    fn symbol_unmapped(&self, provider: Provider) {
        self.unmapped_symbols
            .with_label_values(&[provider.as_str()])
            .inc();
    }

    fn stream_dropped(&self, provider: Provider) {
        self.reconnects.with_label_values(&[provider.as_str()]).inc();
    }

    fn feed_state(&self, provider: Provider, state: ConnectionState) {
        self.set_feed_state(provider, state);
    }

    fn http_call(&self, circuit: &str, outcome: &'static str) {
        self.http_requests
            .with_label_values(&[circuit, outcome])
            .inc();
    }

    fn circuit_state(&self, circuit: &str, state: CircuitState) {
        self.set_circuit_state(circuit, state);
    }
}
