//! Circuit breaker owned by each provider client
//!
//! Three states: Closed (requests pass, failures counted), Open (requests
//! rejected until the reset timeout elapses), HalfOpen (trial requests
//! allowed; enough successes close the circuit, any failure reopens it).
//! Each client owns its own breaker; nothing is shared across instances.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
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

/// Tuning knobs for a [`CircuitBreaker`]
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures (within the window) before the circuit opens
    pub failure_threshold: u32,
    /// Successes required in half-open state to close the circuit
    pub success_threshold: u32,
    /// How long an open circuit rejects requests before allowing a trial
    pub reset_timeout: Duration,
    /// Failures older than this no longer count toward the threshold
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Named circuit breaker, one per client instance
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                opened_at: None,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failures
    }

    /// Whether a request may proceed. An open circuit whose reset timeout has
    /// elapsed transitions to half-open here, so the next caller gets a trial.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            info!(name = %self.name, "circuit breaker entering half-open state");
            inner.state = CircuitState::HalfOpen;
            inner.failures = 0;
            inner.successes = 0;
        }
        inner.state != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                debug!(
                    name = %self.name,
                    successes = inner.successes,
                    threshold = self.config.success_threshold,
                    "trial request succeeded"
                );
                if inner.successes >= self.config.success_threshold {
                    info!(name = %self.name, "circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                // Failures outside the rolling window start a fresh count
                if let Some(last) = inner.last_failure
                    && last.elapsed() > self.config.failure_window
                {
                    inner.failures = 0;
                }
                inner.last_failure = Some(Instant::now());
                inner.failures += 1;
                debug!(
                    name = %self.name,
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    "failure recorded"
                );
                if inner.failures >= self.config.failure_threshold {
                    info!(name = %self.name, failures = inner.failures, "circuit breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(name = %self.name, "trial request failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_opens_after_threshold() {
        let config = BreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = BreakerConfig::default().with_failure_threshold(3);
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let config = BreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(10));
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let config = BreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(5));
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = BreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(5));
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_reset_closes_circuit() {
        let config = BreakerConfig::default().with_failure_threshold(1);
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
