//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP clients, WebSockets, the axum server).
//! Each sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `feeds`: provider stream protocols, REST sources and the supervisor
//! - `http`: reqwest transport, circuit breakers and the resilient client
//! - `metrics`: Prometheus metrics export and health checks
//! - `server`: consumer price API

pub mod feeds;
pub mod http;
pub mod metrics;
pub mod server;
