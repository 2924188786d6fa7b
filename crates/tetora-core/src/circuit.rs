//! Per-provider circuit breakers
//!
//! Protects calls to one provider with three states:
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls are rejected until `open_until` has passed
//! - HalfOpen: exactly one probe call is admitted at a time

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failures exceeded the threshold, calls are rejected
    Open,
    /// Testing recovery with a single probe
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

impl CircuitState {
    /// Numeric encoding for the `circuit_state` gauge
    #[must_use]
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub fail_threshold: u32,
    /// Consecutive probe successes before the circuit closes
    pub success_threshold: u32,
    /// Seconds the circuit stays open before admitting a probe
    pub open_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 30,
        }
    }
}

impl CircuitConfig {
    /// Open timeout as a duration
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

/// Outcome of asking the breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed
    Allowed,
    /// Circuit is open (or a probe is already in flight)
    Rejected,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one provider
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_until: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The breaker's provider name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (transitions Open → HalfOpen when due)
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state
    }

    /// Ask for admission.
    ///
    /// In HalfOpen only one caller at a time receives `Allowed`; the slot is
    /// released by `record_success`, `record_failure`, or `record_cancelled`.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let due = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if !due {
                    return Admission::Rejected;
                }
                info!(provider = %self.name, "circuit entering half-open");
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.probe_in_flight = true;
                Admission::Allowed
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                debug!(
                    provider = %self.name,
                    successes = inner.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "probe succeeded"
                );
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(provider = %self.name, "circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.open_until = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    provider = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.config.fail_threshold,
                    "failure recorded"
                );
                if inner.consecutive_failures >= self.config.fail_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.name, "probe failed, reopening circuit");
                inner.probe_in_flight = false;
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Release a probe slot without counting the outcome.
    ///
    /// Caller-initiated cancellation is neither a success nor a failure.
    pub fn record_cancelled(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn open(&self, inner: &mut Inner) {
        warn!(
            provider = %self.name,
            failures = inner.consecutive_failures,
            open_secs = self.config.open_timeout_secs,
            "circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.config.open_timeout());
        inner.consecutive_successes = 0;
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.open_until = None;
        inner.probe_in_flight = false;
    }
}

/// Process-wide provider name → breaker map
#[derive(Default)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    /// Create a registry with the given per-breaker config
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a provider
    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(breaker) = breakers.get(provider) {
            return breaker.clone();
        }
        drop(breakers);

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config)))
            .clone()
    }

    /// Snapshot of (provider, state) for the `circuit_state` gauge
    #[must_use]
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}
