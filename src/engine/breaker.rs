//! Per-model circuit breakers.
//!
//! One breaker per model name, each behind its own lock so unrelated models
//! never contend. The registry performs no I/O and never fails: callers get a
//! bool or nothing back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failed tasks before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Health of one model.
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub cooldown: Duration,
    /// When the current half-open trial was granted.
    trial_granted_at: Option<Instant>,
}

impl CircuitState {
    fn closed(cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            cooldown,
            trial_granted_at: None,
        }
    }

    fn cooled_down(&self, since: Option<Instant>, now: Instant) -> bool {
        since.map_or(true, |t| now.saturating_duration_since(t) >= self.cooldown)
    }
}

pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<CircuitState>>>>,
}

fn lock(circuit: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn circuit(&self, model: &str) -> Arc<Mutex<CircuitState>> {
        {
            let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(circuit) = circuits.get(model) {
                return circuit.clone();
            }
        }
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);
        circuits
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::closed(self.config.cooldown))))
            .clone()
    }

    /// Whether a task for `model` may call the remote platform.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits exactly one caller; others are rejected until that trial
    /// reports back (or stays silent for a full cooldown).
    pub fn is_available(&self, model: &str) -> bool {
        let circuit = self.circuit(model);
        let mut c = lock(&circuit);
        let now = Instant::now();
        match c.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if c.cooled_down(c.last_failure_at, now) {
                    c.state = BreakerState::HalfOpen;
                    c.trial_granted_at = Some(now);
                    info!(model = %model, "circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if c.cooled_down(c.trial_granted_at, now) {
                    c.trial_granted_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, model: &str) {
        let circuit = self.circuit(model);
        let mut c = lock(&circuit);
        c.consecutive_failures = 0;
        if c.state == BreakerState::HalfOpen {
            info!(model = %model, "circuit closed after successful trial");
            c.state = BreakerState::Closed;
            c.trial_granted_at = None;
        }
    }

    pub fn record_failure(&self, model: &str) {
        let circuit = self.circuit(model);
        let mut c = lock(&circuit);
        c.consecutive_failures = c.consecutive_failures.saturating_add(1);
        c.last_failure_at = Some(Instant::now());

        let was_half_open = c.state == BreakerState::HalfOpen;
        if was_half_open || c.consecutive_failures >= self.config.failure_threshold {
            if c.state != BreakerState::Open {
                warn!(
                    model = %model,
                    consecutive_failures = c.consecutive_failures,
                    half_open_trial = was_half_open,
                    "circuit opened"
                );
            }
            c.state = BreakerState::Open;
            c.trial_granted_at = None;
        }
    }

    /// Open the circuit immediately, as if the threshold had just been hit.
    pub fn trip(&self, model: &str) {
        let circuit = self.circuit(model);
        let mut c = lock(&circuit);
        c.state = BreakerState::Open;
        c.consecutive_failures = c.consecutive_failures.max(self.config.failure_threshold);
        c.last_failure_at = Some(Instant::now());
        c.trial_granted_at = None;
    }

    /// Snapshot of one model's breaker.
    pub fn state(&self, model: &str) -> CircuitState {
        lock(&self.circuit(model)).clone()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
