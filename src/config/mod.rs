//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. API keys are
//! never stored in the file: each provider names the environment
//! variable that holds its key. Every field has a default, so an empty
//! file (or none at all) yields a runnable service.

pub mod loader;

use std::time::Duration;

use serde::Deserialize;

use crate::adapters::http::{CallOptions, CircuitBreakerConfig};
use crate::adapters::feeds::ConnectorConfig;
use crate::domain::{CanonicalSymbol, Provider, SymbolMap};
use crate::usecases::AggregatorConfig;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Service identity and logging.
  pub service: ServiceConfig,
  /// Consumer HTTP API.
  pub server: ServerConfig,
  /// Aggregation, cross rates and TTL cache.
  pub aggregator: AggregatorSection,
  /// Timeouts, retries, circuit breakers, reconnect and poll timing.
  pub resilience: ResilienceConfig,
  /// Per-provider endpoints and subscriptions.
  pub providers: ProvidersConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  #[serde(default = "default_service_name")]
  pub name: String,
  /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Emit JSON log lines instead of human-readable ones.
  #[serde(default = "default_true")]
  pub log_json: bool,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: default_service_name(),
      log_level: default_log_level(),
      log_json: default_true(),
    }
  }
}

/// Consumer API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Bind address for `/prices`, `/live`, `/ready` and `/metrics`.
  #[serde(default = "default_bind_address")]
  pub bind_address: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: default_bind_address(),
    }
  }
}

/// Aggregator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSection {
  /// REST result freshness window (milliseconds).
  #[serde(default = "default_ttl_ms")]
  pub ttl_ms: u64,
  /// Absolute spread for derived or ask-less forex quotes.
  #[serde(default = "default_cross_spread")]
  pub cross_spread: f64,
  /// Relative spread for ask-less crypto quotes (basis points).
  #[serde(default = "default_crypto_spread_bps")]
  pub crypto_spread_bps: f64,
  /// Forex pairs reported by `/prices`. Empty = built-in table.
  #[serde(default)]
  pub forex_pairs: Vec<CanonicalSymbol>,
  /// Crypto pairs reported by `/prices`. Empty = built-in table.
  #[serde(default)]
  pub crypto_pairs: Vec<CanonicalSymbol>,
  /// Reject ticks moving more than this fraction from the previous
  /// one. Unset disables the filter.
  #[serde(default)]
  pub max_jump_fraction: Option<f64>,
}

impl Default for AggregatorSection {
  fn default() -> Self {
    Self {
      ttl_ms: default_ttl_ms(),
      cross_spread: default_cross_spread(),
      crypto_spread_bps: default_crypto_spread_bps(),
      forex_pairs: Vec::new(),
      crypto_pairs: Vec::new(),
      max_jump_fraction: None,
    }
  }
}

impl AggregatorSection {
  pub fn to_aggregator_config(&self) -> AggregatorConfig {
    let defaults = AggregatorConfig::default();
    AggregatorConfig {
      ttl: Duration::from_millis(self.ttl_ms),
      cross_spread: self.cross_spread,
      crypto_spread_bps: self.crypto_spread_bps,
      forex_pairs: if self.forex_pairs.is_empty() {
        defaults.forex_pairs
      } else {
        self.forex_pairs.clone()
      },
      crypto_pairs: if self.crypto_pairs.is_empty() {
        defaults.crypto_pairs
      } else {
        self.crypto_pairs.clone()
      },
    }
  }
}

/// Outbound resilience configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
  /// Per-attempt REST deadline (milliseconds).
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
  /// Additional REST attempts after a failure.
  #[serde(default = "default_retries")]
  pub retries: u32,
  /// Fixed wait between REST attempts (milliseconds).
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
  /// Consecutive failed calls before a circuit opens.
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
  /// Time a circuit stays open before a trial call (seconds).
  #[serde(default = "default_cooldown_secs")]
  pub cooldown_secs: u64,
  /// Fixed wait before a stream reconnect (seconds).
  #[serde(default = "default_reconnect_delay_secs")]
  pub reconnect_delay_secs: u64,
  /// Max wait for a login verdict (seconds).
  #[serde(default = "default_auth_timeout_secs")]
  pub auth_timeout_secs: u64,
  /// Fallback poll period (milliseconds).
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Websocket connect deadline (seconds).
  #[serde(default = "default_connect_timeout_secs")]
  pub connect_timeout_secs: u64,
}

impl Default for ResilienceConfig {
  fn default() -> Self {
    Self {
      request_timeout_ms: default_request_timeout_ms(),
      retries: default_retries(),
      retry_delay_ms: default_retry_delay_ms(),
      failure_threshold: default_failure_threshold(),
      cooldown_secs: default_cooldown_secs(),
      reconnect_delay_secs: default_reconnect_delay_secs(),
      auth_timeout_secs: default_auth_timeout_secs(),
      poll_interval_ms: default_poll_interval_ms(),
      connect_timeout_secs: default_connect_timeout_secs(),
    }
  }
}

impl ResilienceConfig {
  pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
      failure_threshold: self.failure_threshold,
      cooldown: Duration::from_secs(self.cooldown_secs),
    }
  }

  /// Call policy for `provider`'s REST circuit.
  pub fn call_options(&self, provider: Provider) -> CallOptions {
    CallOptions::new(provider.rest_circuit())
      .timeout(Duration::from_millis(self.request_timeout_ms))
      .retries(self.retries)
      .retry_delay(Duration::from_millis(self.retry_delay_ms))
  }

  pub fn connector(&self) -> ConnectorConfig {
    ConnectorConfig {
      reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
      auth_timeout: Duration::from_secs(self.auth_timeout_secs),
      ..ConnectorConfig::default()
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }
}

/// Provider sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
  pub binance: ProviderConfig,
  pub polygon: ProviderConfig,
  pub twelvedata: ProviderConfig,
}

impl ProvidersConfig {
  pub fn get(&self, provider: Provider) -> &ProviderConfig {
    match provider {
      Provider::Binance => &self.binance,
      Provider::Polygon => &self.polygon,
      Provider::TwelveData => &self.twelvedata,
    }
  }
}

/// One provider. Unset URLs and key variables fall back to the
/// provider's public endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  /// Master switch: `false` runs neither stream nor REST.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// `false` skips the stream and polls REST from boot.
  #[serde(default = "default_true")]
  pub stream_enabled: bool,
  /// Websocket endpoint override.
  #[serde(default)]
  pub ws_url: Option<String>,
  /// REST base URL override.
  #[serde(default)]
  pub rest_url: Option<String>,
  /// Environment variable holding the API key.
  #[serde(default)]
  pub api_key_env: Option<String>,
  /// Subscribed canonical symbols. Empty = the provider's full table.
  #[serde(default)]
  pub symbols: Vec<CanonicalSymbol>,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stream_enabled: true,
      ws_url: None,
      rest_url: None,
      api_key_env: None,
      symbols: Vec::new(),
    }
  }
}

impl ProviderConfig {
  pub fn ws_url(&self, provider: Provider) -> String {
    self
      .ws_url
      .clone()
      .unwrap_or_else(|| default_ws_url(provider).to_string())
  }

  pub fn rest_url(&self, provider: Provider) -> String {
    self
      .rest_url
      .clone()
      .unwrap_or_else(|| default_rest_url(provider).to_string())
  }

  /// Environment variable name, if the provider needs a key at all.
  pub fn api_key_env(&self, provider: Provider) -> Option<String> {
    self
      .api_key_env
      .clone()
      .or_else(|| default_api_key_env(provider).map(str::to_string))
  }

  /// `Ok(None)` for keyless providers, `Err(var)` when the key is missing.
  pub fn resolve_api_key(&self, provider: Provider) -> Result<Option<String>, String> {
    let Some(var) = self.api_key_env(provider) else {
      return Ok(None);
    };
    match std::env::var(&var) {
      Ok(key) if !key.trim().is_empty() => Ok(Some(key.trim().to_string())),
      _ => Err(var),
    }
  }

  /// Built-in symbol table narrowed to the configured subscription.
  pub fn symbol_map(&self, provider: Provider) -> SymbolMap {
    SymbolMap::for_provider(provider).restricted_to(&self.symbols)
  }
}

fn default_ws_url(provider: Provider) -> &'static str {
  match provider {
    Provider::Binance => "wss://stream.binance.com:9443",
    Provider::Polygon => "wss://socket.polygon.io/forex",
    Provider::TwelveData => "wss://ws.twelvedata.com/v1/quotes/price",
  }
}

fn default_rest_url(provider: Provider) -> &'static str {
  match provider {
    Provider::Binance => "https://api.binance.com",
    Provider::Polygon => "https://api.polygon.io",
    Provider::TwelveData => "https://api.twelvedata.com",
  }
}

fn default_api_key_env(provider: Provider) -> Option<&'static str> {
  match provider {
    Provider::Binance => None,
    Provider::Polygon => Some("POLYGON_API_KEY"),
    Provider::TwelveData => Some("TWELVEDATA_API_KEY"),
  }
}

// Default value functions for serde

fn default_service_name() -> String {
  "price-feed-aggregator".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_bind_address() -> String {
  "0.0.0.0:8080".to_string()
}

fn default_ttl_ms() -> u64 {
  3_000
}

fn default_cross_spread() -> f64 {
  0.0002
}

fn default_crypto_spread_bps() -> f64 {
  5.0
}

fn default_request_timeout_ms() -> u64 {
  5_000
}

fn default_retries() -> u32 {
  2
}

fn default_retry_delay_ms() -> u64 {
  500
}

fn default_failure_threshold() -> u32 {
  5
}

fn default_cooldown_secs() -> u64 {
  30
}

fn default_reconnect_delay_secs() -> u64 {
  5
}

fn default_auth_timeout_secs() -> u64 {
  10
}

fn default_poll_interval_ms() -> u64 {
  3_000
}

fn default_connect_timeout_secs() -> u64 {
  10
}
