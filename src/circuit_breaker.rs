//! CircuitBreaker and CircuitBreakerRegistry (spec §4.2).

use crate::config::CircuitBreakerConfig;
use crate::model::CircuitState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_attempts: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// A single provider's three-state breaker (spec §4.2 table).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_attempts: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        self.state.lock().unwrap().state
    }

    fn maybe_transition_to_half_open(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.state == CircuitState::Open {
            if let Some(opened_at) = guard.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_attempts = 0;
                    guard.probe_in_flight = false;
                    guard.opened_at = None;
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.failure_count = 0;
        guard.half_open_attempts = 0;
        guard.probe_in_flight = false;
        guard.state = CircuitState::Closed;
        guard.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.lock().unwrap();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count += 1;
                if guard.failure_count >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                guard.half_open_attempts += 1;
                guard.probe_in_flight = false;
                if guard.half_open_attempts >= self.config.half_open_max_attempts {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                } else {
                    guard.state = CircuitState::HalfOpen;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// True when the breaker is OPEN, or when it is HALF_OPEN and a probe
    /// is already in flight (at most one concurrent probe, spec §8 invariant 3).
    pub fn should_reject(&self) -> bool {
        self.maybe_transition_to_half_open();
        let mut guard = self.state.lock().unwrap();
        match guard.state {
            CircuitState::Open => true,
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    true
                } else {
                    guard.probe_in_flight = true;
                    false
                }
            }
        }
    }
}

/// Keyed by provider identity (spec §4.2). Provider-specific: a crashed
/// worker kind does not disable healthy ones.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
    disposed: AtomicBool,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn get_or_create(&self, provider: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn is_provider_open(&self, provider: &str) -> bool {
        self.get_or_create(provider).should_reject()
    }

    /// Diagnostic only (Open Question #1 in DESIGN.md): the PermitGate
    /// never consults this for admission decisions, only provider-specific
    /// `is_provider_open`.
    pub fn is_any_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|entry| entry.value().current_state() == CircuitState::Open)
    }

    pub fn record_success(&self, provider: &str) {
        self.get_or_create(provider).record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.get_or_create(provider).record_failure();
    }

    pub fn get_snapshot(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().current_state()))
            .collect()
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(150),
            half_open_max_attempts: 1,
        }
    }

    #[test]
    fn closed_to_open_after_threshold_failures() {
        let cb = CircuitBreaker::new(config());
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[test]
    fn open_transitions_to_half_open_after_reset_timeout_then_closes_on_success() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.current_state(), CircuitState::Open);
        sleep(Duration::from_millis(200));
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_allows_only_one_concurrent_probe() {
        let cb = CircuitBreaker::new(config());
        for _ in 0..3 {
            cb.record_failure();
        }
        sleep(Duration::from_millis(200));
        assert!(!cb.should_reject(), "first probe should be permitted");
        assert!(cb.should_reject(), "second concurrent probe must be rejected");
    }

    #[test]
    fn registry_is_provider_specific() {
        let registry = CircuitBreakerRegistry::new(config());
        for _ in 0..3 {
            registry.record_failure("CLAUDE_CODE");
        }
        assert!(registry.is_provider_open("CLAUDE_CODE"));
        assert!(!registry.is_provider_open("CODEX_CLI"));
    }
}
