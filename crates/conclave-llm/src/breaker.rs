//! Per-model circuit breaking for gateway calls.
//!
//! [`CircuitBreaker`] tracks a rolling window of call outcomes per model
//! identifier. When the failure ratio over the window exceeds the trip
//! threshold (with a minimum sample size), the circuit opens and calls
//! short immediately with [`GatewayError::CircuitOpen`]. After a
//! cooldown, a single probe is let through (half-open); its outcome
//! closes or re-opens the circuit.
//!
//! States: `closed → open → half-open → closed`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::retry::is_retryable;
use crate::types::{CompletionRequest, CompletionResult, StreamChunk};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Maximum outcomes kept in the rolling window (default: 20).
    pub window_len: usize,
    /// Outcomes older than this are evicted (default: 60 s).
    pub window_age: Duration,
    /// Failure ratio that trips the circuit (default: 0.5).
    pub trip_ratio: f64,
    /// Minimum outcomes in the window before tripping (default: 5).
    pub min_samples: usize,
    /// How long an open circuit waits before the half-open probe
    /// (default: 30 s).
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_len: 20,
            window_age: Duration::from_secs(60),
            trip_ratio: 0.5,
            min_samples: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable state of one model's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ModelCircuit {
    state: BreakerState,
    /// Rolling outcome window: (when, success).
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl ModelCircuit {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn evict_old(&mut self, now: Instant, config: &BreakerConfig) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > config.window_age {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > config.window_len {
            self.window.pop_front();
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Tracks circuit state per model identifier.
///
/// Outcome recording sits on the hot path of every gateway call, so the
/// whole table lives behind a single short-hold mutex; no I/O happens
/// under the lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, ModelCircuit>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a call to `model` may proceed.
    ///
    /// Returns `Err(CircuitOpen)` when the circuit is open and cooling
    /// down, or when a half-open probe is already in flight.
    pub fn allow(&self, model: &str) -> Result<()> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock().expect("breaker lock");
        let circuit = circuits
            .entry(model.to_string())
            .or_insert_with(ModelCircuit::new);

        match circuit.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                if now.duration_since(opened_at) >= self.config.cooldown {
                    circuit.state = BreakerState::HalfOpen;
                    circuit.probe_in_flight = true;
                    debug!(model, "circuit half-open: letting probe through");
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        model: model.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if circuit.probe_in_flight {
                    Err(GatewayError::CircuitOpen {
                        model: model.to_string(),
                    })
                } else {
                    circuit.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of a call to `model`.
    pub fn record(&self, model: &str, success: bool) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock().expect("breaker lock");
        let circuit = circuits
            .entry(model.to_string())
            .or_insert_with(ModelCircuit::new);

        match circuit.state {
            BreakerState::HalfOpen => {
                circuit.probe_in_flight = false;
                if success {
                    circuit.state = BreakerState::Closed;
                    circuit.window.clear();
                    circuit.window.push_back((now, true));
                    circuit.opened_at = None;
                    debug!(model, "circuit closed after successful probe");
                } else {
                    circuit.state = BreakerState::Open;
                    circuit.opened_at = Some(now);
                    warn!(model, "probe failed, circuit re-opened");
                }
            }
            _ => {
                circuit.window.push_back((now, success));
                circuit.evict_old(now, &self.config);

                if circuit.state == BreakerState::Closed
                    && circuit.window.len() >= self.config.min_samples
                    && circuit.failure_ratio() > self.config.trip_ratio
                {
                    circuit.state = BreakerState::Open;
                    circuit.opened_at = Some(now);
                    warn!(
                        model,
                        failure_ratio = circuit.failure_ratio(),
                        samples = circuit.window.len(),
                        "circuit tripped open"
                    );
                }
            }
        }
    }

    /// The current state of `model`'s circuit.
    pub fn state(&self, model: &str) -> BreakerState {
        let circuits = self.circuits.lock().expect("breaker lock");
        circuits
            .get(model)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }
}

/// A gateway wrapper that shorts calls to models with an open circuit.
///
/// Layering order matters: the breaker wraps the retry policy, so a
/// model that keeps failing through its retries accumulates failures in
/// the window and eventually shorts without touching the network.
pub struct CircuitBreakerPolicy<G> {
    inner: G,
    breaker: CircuitBreaker,
}

impl<G: Gateway> CircuitBreakerPolicy<G> {
    /// Wrap a gateway with circuit breaking.
    pub fn new(inner: G, config: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    /// Access the breaker (state inspection, tests).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether an error counts as a failure for breaker accounting.
    ///
    /// Transient upstream failures and invalid responses count; caller
    /// mistakes (auth, unknown model, content policy) do not -- those say
    /// nothing about the model's health.
    fn counts_as_failure(err: &GatewayError) -> bool {
        is_retryable(err) || matches!(err, GatewayError::InvalidResponse(_))
    }
}

#[async_trait]
impl<G: Gateway> Gateway for CircuitBreakerPolicy<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        self.breaker.allow(&request.model)?;

        match self.inner.complete(request).await {
            Ok(result) => {
                self.breaker.record(&request.model, true);
                Ok(result)
            }
            Err(err) => {
                if Self::counts_as_failure(&err) {
                    self.breaker.record(&request.model, false);
                }
                Err(err)
            }
        }
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        self.breaker.allow(&request.model)?;

        match self.inner.complete_stream(request, tx).await {
            Ok(()) => {
                self.breaker.record(&request.model, true);
                Ok(())
            }
            Err(err) => {
                if Self::counts_as_failure(&err) {
                    self.breaker.record(&request.model, false);
                }
                Err(err)
            }
        }
    }
}

impl<G: std::fmt::Debug> std::fmt::Debug for CircuitBreakerPolicy<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("inner", &self.inner)
            .finish()
    }
}
