//! Metrics and Monitoring Adapters
//!
//! Provides Prometheus metrics export on `/metrics` and health check
//! endpoints (/live, /ready) via axum 0.7, served next to the price API.

pub mod health;
pub mod prometheus;

pub use health::{HealthServer, HealthState};
pub use prometheus::MetricsRegistry;
