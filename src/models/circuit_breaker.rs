use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::platform::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Count polling timeouts toward the threshold like network failures.
    pub timeout_trips_breaker: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            timeout_trips_breaker: false,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ProviderCircuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_error_kind: Option<ErrorKind>,
    // Bumped on every recorded failure; lets a finishing attempt tell
    // whether someone else failed while it was in flight.
    failure_seq: u64,
}

impl ProviderCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_error_kind: None,
            failure_seq: 0,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
    }
}

/// Handed out when an attempt starts, returned when it succeeds.
#[derive(Debug, Clone)]
pub struct AttemptTicket {
    provider: String,
    failure_seq: u64,
}

impl AttemptTicket {
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub failure_count: u32,
    pub circuit_open: bool,
    pub half_open: bool,
    pub last_error_kind: Option<ErrorKind>,
    pub seconds_since_last_failure: Option<u64>,
}

/// Per-provider failure tracker. Each provider's state sits behind its own
/// mutex so updates for one provider never block another.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, Arc<Mutex<ProviderCircuit>>>>,
    config: RwLock<BreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Creating circuit breaker with threshold {} and cooldown {:?}",
            config.failure_threshold,
            config.cooldown()
        );

        Self {
            circuits: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            clock,
        }
    }

    pub fn update_config(&self, config: BreakerConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> BreakerConfig {
        self.config.read().clone()
    }

    fn circuit(&self, provider: &str) -> Arc<Mutex<ProviderCircuit>> {
        if let Some(circuit) = self.circuits.read().get(provider) {
            return circuit.clone();
        }
        self.circuits
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderCircuit::new())))
            .clone()
    }

    fn existing(&self, provider: &str) -> Option<Arc<Mutex<ProviderCircuit>>> {
        self.circuits.read().get(provider).cloned()
    }

    /// Whether a call to `provider` may go out now. An open circuit whose
    /// cooldown has elapsed moves to half-open and clears its counter.
    pub fn should_attempt(&self, provider: &str) -> bool {
        let Some(circuit) = self.existing(provider) else {
            return true;
        };
        let cooldown = self.config.read().cooldown();
        let mut circuit = circuit.lock();

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { opened_at } => {
                let since = circuit.last_failure_at.unwrap_or(opened_at);
                if self.clock.now().saturating_duration_since(since) >= cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.failure_count = 0;
                    info!("Circuit for '{}' transitioning to half-open", provider);
                    true
                } else {
                    debug!("Circuit for '{}' is open, skipping", provider);
                    false
                }
            }
        }
    }

    pub fn record_failure(&self, provider: &str, kind: ErrorKind) {
        let config = self.config.read().clone();
        let now = self.clock.now();
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();

        circuit.failure_seq += 1;
        circuit.last_failure_at = Some(now);
        circuit.last_error_kind = Some(kind);

        let counts = kind != ErrorKind::Timeout || config.timeout_trips_breaker;
        if counts {
            circuit.failure_count += 1;
        }
        debug!(
            "Circuit for '{}' recorded {} failure ({}/{})",
            provider, kind, circuit.failure_count, config.failure_threshold
        );

        let trip = match circuit.state {
            CircuitState::HalfOpen => counts || kind.trips_immediately(),
            CircuitState::Closed => kind.trips_immediately() || circuit.failure_count >= config.failure_threshold,
            CircuitState::Open { .. } => counts,
        };

        if trip {
            if !matches!(circuit.state, CircuitState::Open { .. }) {
                warn!(
                    "Circuit for '{}' opened after {} failure (count {})",
                    provider, kind, circuit.failure_count
                );
            }
            circuit.state = CircuitState::Open { opened_at: now };
        }
    }

    /// Clears the counter and closes the circuit, whatever its state.
    pub fn record_success(&self, provider: &str) {
        let circuit = self.circuit(provider);
        let mut circuit = circuit.lock();
        if !matches!(circuit.state, CircuitState::Closed) {
            info!("Circuit for '{}' recovered, closing", provider);
        }
        circuit.close();
    }

    pub fn begin_attempt(&self, provider: &str) -> AttemptTicket {
        let failure_seq = self
            .existing(provider)
            .map(|c| c.lock().failure_seq)
            .unwrap_or(0);
        AttemptTicket {
            provider: provider.to_string(),
            failure_seq,
        }
    }

    /// Success path for the manager. Leaves the circuit alone when another
    /// attempt recorded a failure after this one started.
    pub fn record_attempt_success(&self, ticket: &AttemptTicket) -> bool {
        let circuit = self.circuit(&ticket.provider);
        let mut circuit = circuit.lock();
        if circuit.failure_seq != ticket.failure_seq {
            debug!(
                "Circuit for '{}' saw a concurrent failure, keeping state {:?}",
                ticket.provider, circuit.state
            );
            return false;
        }
        if !matches!(circuit.state, CircuitState::Closed) {
            info!("Circuit for '{}' recovered, closing", ticket.provider);
        }
        circuit.close();
        true
    }

    pub fn reset(&self, provider: &str) {
        if let Some(circuit) = self.existing(provider) {
            let mut circuit = circuit.lock();
            circuit.close();
            circuit.last_error_kind = None;
            info!("Circuit for '{}' manually reset", provider);
        }
    }

    pub fn failure_count(&self, provider: &str) -> u32 {
        self.existing(provider)
            .map(|c| c.lock().failure_count)
            .unwrap_or(0)
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.existing(provider)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self, provider: &str) -> bool {
        matches!(self.state(provider), CircuitState::Open { .. })
    }

    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        let now = self.clock.now();
        match self.existing(provider) {
            Some(circuit) => {
                let circuit = circuit.lock();
                CircuitSnapshot {
                    provider: provider.to_string(),
                    failure_count: circuit.failure_count,
                    circuit_open: matches!(circuit.state, CircuitState::Open { .. }),
                    half_open: matches!(circuit.state, CircuitState::HalfOpen),
                    last_error_kind: circuit.last_error_kind,
                    seconds_since_last_failure: circuit
                        .last_failure_at
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                }
            }
            None => CircuitSnapshot {
                provider: provider.to_string(),
                failure_count: 0,
                circuit_open: false,
                half_open: false,
                last_error_kind: None,
                seconds_since_last_failure: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ManualClock;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = BreakerConfig {
            failure_threshold: threshold,
            cooldown_secs: 60,
            timeout_trips_breaker: false,
        };
        (CircuitBreaker::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let (cb, _clock) = breaker(3);
        assert!(cb.should_attempt("openai"));

        for i in 0..3 {
            cb.record_failure("openai", ErrorKind::Transient);
            if i < 2 {
                assert!(!cb.is_open("openai"));
            }
        }

        assert!(cb.is_open("openai"));
        assert_eq!(cb.failure_count("openai"), 3);
        assert!(!cb.should_attempt("openai"));
    }

    #[test]
    fn test_quota_trips_immediately() {
        let (cb, _clock) = breaker(5);
        cb.record_failure("openai", ErrorKind::Quota);
        assert!(cb.is_open("openai"));
        assert_eq!(cb.failure_count("openai"), 1);
    }

    #[test]
    fn test_stays_open_until_cooldown() {
        let (cb, clock) = breaker(2);
        cb.record_failure("gemini", ErrorKind::Transient);
        cb.record_failure("gemini", ErrorKind::UpstreamFormat);

        for _ in 0..5 {
            assert!(!cb.should_attempt("gemini"));
        }
        clock.advance(Duration::from_secs(59));
        assert!(!cb.should_attempt("gemini"));

        clock.advance(Duration::from_secs(1));
        assert!(cb.should_attempt("gemini"));
        assert_eq!(cb.failure_count("gemini"), 0);
        assert_eq!(cb.state("gemini"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker(3);
        for _ in 0..3 {
            cb.record_failure("anthropic", ErrorKind::Transient);
        }
        clock.advance(Duration::from_secs(61));
        assert!(cb.should_attempt("anthropic"));

        cb.record_failure("anthropic", ErrorKind::Transient);
        assert!(cb.is_open("anthropic"));
        assert!(!cb.should_attempt("anthropic"));
    }

    #[test]
    fn test_record_success_resets_open_circuit() {
        let (cb, _clock) = breaker(1);
        cb.record_failure("replicate", ErrorKind::Transient);
        assert!(cb.is_open("replicate"));

        cb.record_success("replicate");
        assert!(!cb.is_open("replicate"));
        assert_eq!(cb.failure_count("replicate"), 0);
        assert!(cb.should_attempt("replicate"));
    }

    #[test]
    fn test_timeout_does_not_count_by_default() {
        let (cb, _clock) = breaker(1);
        cb.record_failure("replicate", ErrorKind::Timeout);
        assert!(!cb.is_open("replicate"));
        assert_eq!(cb.failure_count("replicate"), 0);
        assert_eq!(cb.snapshot("replicate").last_error_kind, Some(ErrorKind::Timeout));

        cb.update_config(BreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 60,
            timeout_trips_breaker: true,
        });
        cb.record_failure("replicate", ErrorKind::Timeout);
        assert!(cb.is_open("replicate"));
    }

    #[test]
    fn test_stray_success_does_not_mask_concurrent_failure() {
        let (cb, _clock) = breaker(5);
        let slow = cb.begin_attempt("openai");
        cb.record_failure("openai", ErrorKind::Quota);

        assert!(!cb.record_attempt_success(&slow));
        assert!(cb.is_open("openai"));

        let fresh = cb.begin_attempt("openai");
        assert!(cb.record_attempt_success(&fresh));
        assert!(!cb.is_open("openai"));
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let (cb, _clock) = breaker(10_000);
        let cb = Arc::new(cb);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cb.record_failure("openai", ErrorKind::Transient);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cb.failure_count("openai"), 800);
    }

    #[test]
    fn test_snapshot_of_unknown_provider_is_healthy() {
        let (cb, _clock) = breaker(5);
        let snapshot = cb.snapshot("nobody");
        assert_eq!(snapshot.failure_count, 0);
        assert!(!snapshot.circuit_open);
    }
}
