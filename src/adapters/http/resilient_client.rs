//! Resilient HTTP Client - Timeout, Fixed-Delay Retry, Circuit Breaker
//!
//! Every REST path in the service (fallback polling, single-flight
//! refresh, candle history) goes through [`ResilientClient::call`].
//! Retry delay is fixed: no backoff growth, no jitter.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::circuit_breaker::{Admission, CircuitBreakerConfig, CircuitRegistry};
use crate::domain::{CircuitState, FeedError};
use crate::ports::{FeedTelemetry, HttpTransport};

/// Per-call policy.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Fixed wait between attempts.
    pub retry_delay: Duration,
    /// Circuit guarding this call.
    pub circuit: String,
}

impl CallOptions {
    pub fn new(circuit: impl Into<String>) -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 2,
            retry_delay: Duration::from_millis(500),
            circuit: circuit.into(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Releases an abandoned half-open trial if the call future is dropped
/// before it settles.
struct TrialGuard<'a> {
    circuits: &'a CircuitRegistry,
    name: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.circuits.abandon_trial(self.name);
        }
    }
}

/// HTTP GET wrapper with timeout, retry and named circuit breakers.
pub struct ResilientClient {
    transport: Arc<dyn HttpTransport>,
    circuits: CircuitRegistry,
    telemetry: Option<Arc<dyn FeedTelemetry>>,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: CircuitBreakerConfig) -> Self {
        Self {
            transport,
            circuits: CircuitRegistry::new(config),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn FeedTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// GET `url` and decode the JSON body as `T`.
    ///
    /// Fails with `CircuitOpen` without any network I/O when the named
    /// circuit is open. A call that still fails after its retries counts
    /// as one circuit failure; so does an undecodable 2xx body.
    pub async fn call<T: DeserializeOwned>(&self, url: &str, opts: &CallOptions) -> Result<T, FeedError> {
        let admission = self.circuits.try_acquire(&opts.circuit);
        if admission == Admission::Rejected {
            self.count(&opts.circuit, "circuit_open");
            return Err(FeedError::CircuitOpen(opts.circuit.clone()));
        }

        let mut guard = TrialGuard {
            circuits: &self.circuits,
            name: &opts.circuit,
            armed: admission == Admission::Trial,
        };

        let outcome = self
            .attempt_with_retry(url, opts)
            .await
            .and_then(|body| {
                serde_json::from_str::<T>(&body).map_err(|e| FeedError::Parse(e.to_string()))
            });
        guard.armed = false;

        let state = match &outcome {
            Ok(_) => {
                self.circuits.record_success(&opts.circuit);
                self.count(&opts.circuit, "ok");
                CircuitState::Closed
            }
            Err(e) => {
                debug!(circuit = %opts.circuit, error = %e, "Resilient call failed");
                self.count(&opts.circuit, "error");
                self.circuits.record_failure(&opts.circuit)
            }
        };
        if let Some(telemetry) = &self.telemetry {
            telemetry.circuit_state(&opts.circuit, state);
        }

        outcome
    }

    /// Issue the request up to `retries + 1` times with a fixed delay.
    async fn attempt_with_retry(&self, url: &str, opts: &CallOptions) -> Result<String, FeedError> {
        let mut last_error = FeedError::Transport("no attempt made".to_string());

        for attempt in 0..=opts.retries {
            if attempt > 0 {
                debug!(
                    circuit = %opts.circuit,
                    attempt,
                    delay_ms = opts.retry_delay.as_millis() as u64,
                    "Retrying request"
                );
                sleep(opts.retry_delay).await;
            }

            let result = match timeout(opts.timeout, self.transport.get(url, opts.timeout)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::FetchTimeout(opts.timeout.as_millis() as u64)),
            };

            match result {
                Ok(response) if response.is_success() => return Ok(response.body),
                Ok(response) => {
                    warn!(circuit = %opts.circuit, status = response.status, attempt, "Upstream error status");
                    last_error = FeedError::FetchHttp {
                        status: response.status,
                    };
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(circuit = %opts.circuit, error = %e, attempt, "Request failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Observed state of a named circuit. Never mutates breaker state.
    pub fn circuit_status(&self, name: &str) -> CircuitState {
        self.circuits.status(name)
    }

    /// Observed state of every circuit used so far.
    pub fn circuit_statuses(&self) -> Vec<(String, CircuitState)> {
        self.circuits.statuses()
    }

    fn count(&self, circuit: &str, outcome: &'static str) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.http_call(circuit, outcome);
        }
    }
}
