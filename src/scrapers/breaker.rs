//! Per-origin circuit breaker.
//!
//! Closed counts consecutive failures; at the threshold the circuit opens
//! and rejects fetches for a cool-down. After the cool-down a single probe
//! is admitted: success closes the circuit, failure re-opens it with a
//! doubled cool-down up to a cap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub open_threshold: u32,
    pub cool_down: Duration,
    pub cool_down_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            open_threshold: 5,
            cool_down: Duration::from_secs(60),
            cool_down_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for a fetch against an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected,
}

#[derive(Debug)]
struct OriginCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cool_down: Duration,
    probe_in_flight: bool,
}

impl OriginCircuit {
    fn new(cool_down: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            current_cool_down: cool_down,
            probe_in_flight: false,
        }
    }
}

/// Registry of circuits keyed by origin (scheme + host). Updates take a
/// short critical section per origin; there is no global lock held across
/// fetches.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    origins: Mutex<HashMap<String, Arc<Mutex<OriginCircuit>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            origins: Mutex::new(HashMap::new()),
        }
    }

    fn circuit(&self, origin: &str) -> Arc<Mutex<OriginCircuit>> {
        let mut origins = self.origins.lock().expect("breaker registry poisoned");
        origins
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OriginCircuit::new(self.config.cool_down))))
            .clone()
    }

    /// Ask whether a fetch against this origin may proceed.
    pub fn admit(&self, origin: &str) -> Admission {
        let circuit = self.circuit(origin);
        let mut circuit = circuit.lock().expect("origin circuit poisoned");

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let expired = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= circuit.current_cool_down)
                    .unwrap_or(true);
                if expired {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    debug!("circuit for {} half-open, admitting probe", origin);
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Admission::Rejected
                } else {
                    circuit.probe_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Record a successful fetch of non-trivial content.
    pub fn on_success(&self, origin: &str) {
        let circuit = self.circuit(origin);
        let mut circuit = circuit.lock().expect("origin circuit poisoned");

        if circuit.state != CircuitState::Closed {
            info!("circuit for {} closed after successful probe", origin);
        }
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.current_cool_down = self.config.cool_down;
        circuit.probe_in_flight = false;
    }

    /// Record a counted failure (transport, timeout, genuine 4xx/5xx,
    /// insufficient content). Protection detections must not be reported
    /// here.
    pub fn on_failure(&self, origin: &str) {
        let circuit = self.circuit(origin);
        let mut circuit = circuit.lock().expect("origin circuit poisoned");

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.open_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    warn!(
                        "circuit for {} opened after {} consecutive failures (cool-down {:?})",
                        origin, circuit.consecutive_failures, circuit.current_cool_down
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Failed probe: back to open with doubled cool-down.
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.probe_in_flight = false;
                circuit.current_cool_down =
                    (circuit.current_cool_down * 2).min(self.config.cool_down_cap);
                warn!(
                    "probe for {} failed, circuit re-opened (cool-down {:?})",
                    origin, circuit.current_cool_down
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, for tests and status reporting.
    pub fn state(&self, origin: &str) -> CircuitState {
        let circuit = self.circuit(origin);
        let circuit = circuit.lock().expect("origin circuit poisoned");
        circuit.state
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            open_threshold: 3,
            cool_down: Duration::from_millis(20),
            cool_down_cap: Duration::from_millis(80),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let registry = fast_registry();
        let origin = "https://example.com.br";

        for _ in 0..2 {
            registry.on_failure(origin);
            assert_eq!(registry.state(origin), CircuitState::Closed);
        }
        registry.on_failure(origin);
        assert_eq!(registry.state(origin), CircuitState::Open);
        assert_eq!(registry.admit(origin), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let registry = fast_registry();
        let origin = "https://example.com.br";

        registry.on_failure(origin);
        registry.on_failure(origin);
        registry.on_success(origin);
        registry.on_failure(origin);
        registry.on_failure(origin);
        assert_eq!(registry.state(origin), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let registry = fast_registry();
        let origin = "https://example.com.br";

        for _ in 0..3 {
            registry.on_failure(origin);
        }
        std::thread::sleep(Duration::from_millis(25));

        assert_eq!(registry.admit(origin), Admission::Allowed);
        // Second caller while the probe is in flight is rejected.
        assert_eq!(registry.admit(origin), Admission::Rejected);

        registry.on_success(origin);
        assert_eq!(registry.state(origin), CircuitState::Closed);
        assert_eq!(registry.admit(origin), Admission::Allowed);
    }

    #[test]
    fn test_failed_probe_doubles_cool_down() {
        let registry = fast_registry();
        let origin = "https://example.com.br";

        for _ in 0..3 {
            registry.on_failure(origin);
        }
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(registry.admit(origin), Admission::Allowed);
        registry.on_failure(origin);
        assert_eq!(registry.state(origin), CircuitState::Open);

        // The original cool-down has elapsed but the doubled one has not.
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(registry.admit(origin), Admission::Rejected);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(registry.admit(origin), Admission::Allowed);
    }

    #[test]
    fn test_origins_are_independent() {
        let registry = fast_registry();
        for _ in 0..3 {
            registry.on_failure("https://a.com.br");
        }
        assert_eq!(registry.admit("https://a.com.br"), Admission::Rejected);
        assert_eq!(registry.admit("https://b.com.br"), Admission::Allowed);
    }
}
