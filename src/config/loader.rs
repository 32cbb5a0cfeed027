//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::AppConfig;
use crate::domain::Provider;

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    path = %path.display(),
    ttl_ms = config.aggregator.ttl_ms,
    failure_threshold = config.resilience.failure_threshold,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
/// A file that exists and is invalid is still an error.
pub fn load_or_default(path: &str) -> Result<AppConfig> {
  if Path::new(path).exists() {
    return load_config(path);
  }
  warn!(path, "Config file not found, using built-in defaults");
  let config = AppConfig::default();
  validate_config(&config)?;
  Ok(config)
}

/// Parse and validate TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig = toml::from_str(content).with_context(|| "Failed to parse config.toml")?;
  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Positive intervals and timeouts
/// - Non-negative spreads
/// - Circuit threshold of at least one failure
/// - Non-empty URLs for enabled providers
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    !config.server.bind_address.is_empty(),
    "server.bind_address must not be empty"
  );

  // Aggregator validation
  let agg = &config.aggregator;
  anyhow::ensure!(agg.ttl_ms > 0, "aggregator.ttl_ms must be positive");
  anyhow::ensure!(
    agg.cross_spread >= 0.0 && agg.cross_spread.is_finite(),
    "aggregator.cross_spread must be >= 0, got {}",
    agg.cross_spread
  );
  anyhow::ensure!(
    agg.crypto_spread_bps >= 0.0 && agg.crypto_spread_bps.is_finite(),
    "aggregator.crypto_spread_bps must be >= 0, got {}",
    agg.crypto_spread_bps
  );
  if let Some(jump) = agg.max_jump_fraction {
    anyhow::ensure!(
      jump > 0.0 && jump.is_finite(),
      "aggregator.max_jump_fraction must be positive, got {}",
      jump
    );
  }

  // Resilience validation
  let res = &config.resilience;
  anyhow::ensure!(
    res.failure_threshold >= 1,
    "resilience.failure_threshold must be at least 1"
  );
  anyhow::ensure!(
    res.request_timeout_ms > 0,
    "resilience.request_timeout_ms must be positive"
  );
  anyhow::ensure!(
    res.cooldown_secs > 0,
    "resilience.cooldown_secs must be positive"
  );
  anyhow::ensure!(
    res.reconnect_delay_secs > 0,
    "resilience.reconnect_delay_secs must be positive"
  );
  anyhow::ensure!(
    res.poll_interval_ms > 0,
    "resilience.poll_interval_ms must be positive"
  );
  anyhow::ensure!(
    res.auth_timeout_secs > 0 && res.connect_timeout_secs > 0,
    "resilience auth/connect timeouts must be positive"
  );

  // Provider validation
  for provider in Provider::ALL {
    let section = config.providers.get(provider);
    if !section.enabled {
      continue;
    }
    anyhow::ensure!(
      !section.ws_url(provider).is_empty(),
      "providers.{}.ws_url must not be empty",
      provider
    );
    anyhow::ensure!(
      !section.rest_url(provider).is_empty(),
      "providers.{}.rest_url must not be empty",
      provider
    );
    for symbol in &section.symbols {
      if !section.symbol_map(provider).contains(symbol) {
        warn!(provider = %provider, symbol = %symbol, "Configured symbol has no wire mapping, it will be absent");
      }
    }
  }

  Ok(())
}
