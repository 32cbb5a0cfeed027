use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::adapters::feeds::{FeedSupervisor, ProviderStatus};
use crate::adapters::http::ResilientClient;
use crate::domain::{AggregatedQuoteRecord, AllPrices, Candle, CandleInterval, CanonicalSymbol, CircuitState};
use crate::usecases::history::DEFAULT_LIMIT;
use crate::usecases::{Aggregator, HistoryFetcher};

/// Shared state behind every route.
pub struct ApiState {
    pub aggregator: Arc<Aggregator>,
    pub supervisor: Arc<FeedSupervisor>,
    pub history: Arc<HistoryFetcher>,
    /// Source of circuit states for `/prices/status`.
    pub client: Arc<ResilientClient>,
}

/// Status code plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/prices", get(all_prices))
        .route("/prices/forex", get(forex_prices))
        .route("/prices/crypto", get(crypto_prices))
        .route("/prices/symbol/:symbol", get(symbol_price))
        .route("/prices/clear-cache", post(clear_cache))
        .route("/prices/status", get(status))
        .route("/prices/history/:symbol", get(history))
        .with_state(state)
}

fn parse_symbol(raw: &str) -> Result<CanonicalSymbol, ApiError> {
    CanonicalSymbol::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("invalid symbol '{raw}', expected BASE-QUOTE")))
}

async fn all_prices(State(state): State<Arc<ApiState>>) -> Json<AllPrices> {
    Json(state.aggregator.get_all_prices().await)
}

async fn forex_prices(State(state): State<Arc<ApiState>>) -> Json<Vec<AggregatedQuoteRecord>> {
    Json(state.aggregator.get_all_prices().await.forex)
}

async fn crypto_prices(State(state): State<Arc<ApiState>>) -> Json<Vec<AggregatedQuoteRecord>> {
    Json(state.aggregator.get_all_prices().await.crypto)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolPriceResponse {
    pub symbol: CanonicalSymbol,
    pub price: f64,
}

async fn symbol_price(
    State(state): State<Arc<ApiState>>,
    Path(raw): Path<String>,
) -> Result<Json<SymbolPriceResponse>, ApiError> {
    let symbol = parse_symbol(&raw)?;
    match state.aggregator.get_symbol_price(&symbol).await {
        Some(price) => Ok(Json(SymbolPriceResponse { symbol, price })),
        None => {
            debug!(symbol = %symbol, "No price for symbol");
            Err(ApiError::not_found(format!("no price for {symbol}")))
        }
    }
}

async fn clear_cache(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.aggregator.clear_cache().await;
    info!("Cache cleared via API");
    Json(json!({ "cleared": true }))
}

#[derive(Debug, Serialize)]
struct CircuitView {
    name: String,
    state: CircuitState,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    providers: Vec<ProviderStatus>,
    circuits: Vec<CircuitView>,
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let providers = state.supervisor.status().await;
    let circuits = state
        .client
        .circuit_statuses()
        .into_iter()
        .map(|(name, state)| CircuitView { name, state })
        .collect();
    Json(StatusResponse { providers, circuits })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub interval: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub symbol: CanonicalSymbol,
    pub interval: CandleInterval,
    pub candles: Vec<Candle>,
}

async fn history(
    State(state): State<Arc<ApiState>>,
    Path(raw): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let symbol = parse_symbol(&raw)?;
    let interval: CandleInterval = query
        .interval
        .as_deref()
        .unwrap_or("1h")
        .parse()
        .map_err(ApiError::bad_request)?;
    if !state.history.supports(&symbol) {
        return Err(ApiError::not_found(format!("no history source for {symbol}")));
    }

    let candles = state
        .history
        .fetch(&symbol, interval, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await;
    Ok(Json(HistoryResponse {
        symbol,
        interval,
        candles,
    }))
}
