//! Outbound HTTP - resilient client, circuit breakers and the reqwest transport.

pub mod circuit_breaker;
pub mod resilient_client;
pub mod transport;

pub use circuit_breaker::{Admission, CircuitBreakerConfig, CircuitRegistry};
pub use resilient_client::{CallOptions, ResilientClient};
pub use transport::ReqwestTransport;
