//! Health Check Routes - Liveness and Readiness Probes
//!
//! Exposes /live and /ready via axum 0.7 for container health checks.
//! Readiness depends on the feed supervisor: the service is ready once
//! any provider has prices cached or has moved to REST polling.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::adapters::feeds::FeedSupervisor;

/// Shared health state polled by readiness probes.
#[derive(Clone)]
pub struct HealthState {
    /// Owner of every provider runtime.
    pub supervisor: Arc<FeedSupervisor>,
}

impl HealthState {
    pub fn new(supervisor: Arc<FeedSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Check if the service has anything to serve.
    pub async fn is_ready(&self) -> bool {
        self.supervisor.is_ready().await
    }
}

/// Liveness and readiness routes, merged into the main API router.
pub struct HealthServer {
    state: HealthState,
}

impl HealthServer {
    pub fn new(supervisor: Arc<FeedSupervisor>) -> Self {
        Self {
            state: HealthState::new(supervisor),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .with_state(self.state)
    }

    /// Liveness probe: always returns 200 if the process is running.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness probe: 200 once a provider is feeding or polling.
    async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
        if state.is_ready().await {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}
