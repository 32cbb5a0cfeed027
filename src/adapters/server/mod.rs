//! Consumer API Server - axum Routes Over the Aggregator
//!
//! Serves the canonical price surface, provider status and candle
//! history as JSON. Errors are a status code plus `{"error": "..."}`;
//! price endpoints never answer 5xx.

pub mod routes;

pub use routes::{create_router, ApiError, ApiState};
