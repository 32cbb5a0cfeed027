//! Named circuit breakers for outbound REST calls.
//!
//! ```text
//! CLOSED    → OPEN      (failure_threshold consecutive failures)
//! OPEN      → HALF_OPEN (cooldown elapsed; one trial admitted)
//! HALF_OPEN → CLOSED    (trial succeeded)
//! HALF_OPEN → OPEN      (trial failed; cooldown restarts)
//! ```
//!
//! In-memory, one circuit per name, created lazily on first use.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::CircuitState;

/// Circuit breaker configuration shared by every named circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls before the circuit opens.
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Result of asking a circuit for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; normal call.
    Allowed,
    /// Circuit half-open; this caller holds the single trial slot.
    Trial,
    /// Circuit open (or trial already in flight); fail fast.
    Rejected,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        self.opened_at
            .map(|opened| opened.elapsed() >= cooldown)
            .unwrap_or(true)
    }
}

/// Registry of named circuits.
pub struct CircuitRegistry {
    circuits: Mutex<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Lock the circuits map, recovering from poison: a slightly wrong
    /// circuit state beats a panic on the request path.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Ask permission for one call on `name`.
    ///
    /// Performs the OPEN → HALF_OPEN transition when the cooldown has
    /// elapsed and hands the trial slot to exactly one caller.
    pub fn try_acquire(&self, name: &str) -> Admission {
        let mut circuits = self.lock();
        let circuit = circuits.entry(name.to_string()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if circuit.cooldown_elapsed(self.config.cooldown) {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    info!(circuit = name, "Circuit half-open, admitting trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Admission::Rejected
                } else {
                    circuit.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a successful call; closes the circuit.
    pub fn record_success(&self, name: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(name.to_string()).or_insert_with(Circuit::new);

        if circuit.state != CircuitState::Closed {
            info!(circuit = name, "Circuit closed after successful trial");
        }
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.trial_in_flight = false;
    }

    /// Record a failed call. Returns the state after the transition.
    pub fn record_failure(&self, name: &str) -> CircuitState {
        let mut circuits = self.lock();
        let circuit = circuits.entry(name.to_string()).or_insert_with(Circuit::new);

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.trial_in_flight = false;
                warn!(circuit = name, "Trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    warn!(
                        circuit = name,
                        failures = circuit.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
        circuit.state
    }

    /// Release a trial slot whose call was abandoned (caller dropped).
    /// Counts as a failed trial so the cooldown restarts.
    pub fn abandon_trial(&self, name: &str) {
        let mut circuits = self.lock();
        if let Some(circuit) = circuits.get_mut(name) {
            if circuit.state == CircuitState::HalfOpen && circuit.trial_in_flight {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.trial_in_flight = false;
            }
        }
    }

    /// Observed state of `name`. Read-only: an OPEN circuit whose cooldown
    /// elapsed is reported HALF_OPEN without being transitioned.
    pub fn status(&self, name: &str) -> CircuitState {
        let circuits = self.lock();
        match circuits.get(name) {
            None => CircuitState::Closed,
            Some(c) if c.state == CircuitState::Open && c.cooldown_elapsed(self.config.cooldown) => {
                CircuitState::HalfOpen
            }
            Some(c) => c.state,
        }
    }

    /// Observed state of every circuit used so far, sorted by name.
    pub fn statuses(&self) -> Vec<(String, CircuitState)> {
        let names: Vec<String> = self.lock().keys().cloned().collect();
        let mut out: Vec<_> = names
            .into_iter()
            .map(|name| {
                let state = self.status(&name);
                (name, state)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
