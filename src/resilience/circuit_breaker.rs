use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the breaker, as exposed by `circuit_breaker_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<SystemTime>,
    pub max_failures: u32,
    pub reset_timeout_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<SystemTime>,
}

/// Three-state circuit breaker guarding one downstream dependency.
///
/// - Closed: requests pass; consecutive failures are counted
/// - Open: requests are rejected until `reset_timeout` has elapsed since the last failure
/// - HalfOpen: requests pass; the next outcome closes or re-opens the circuit
///
/// All transitions happen under a single mutex, so two racing failures can
/// never both miss the threshold.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: std::sync::Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::named("default", cfg)
    }

    pub fn named(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        let cfg = CircuitBreakerConfig {
            max_failures: cfg.max_failures.max(1),
            ..cfg
        };
        Self {
            name: name.into(),
            cfg,
            state: std::sync::Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_wall: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The guarded state is plain data; a panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if a request may proceed.
    ///
    /// In the Open state, the first check after the reset timeout moves the
    /// breaker to HalfOpen and lets that request through as the probe.
    pub fn allow_request(&self) -> bool {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = st
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.cfg.reset_timeout {
                    st.state = CircuitState::HalfOpen;
                    info!(breaker = self.name.as_str(), "circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        match st.state {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Closed;
                st.consecutive_failures = 0;
                info!(breaker = self.name.as_str(), "circuit breaker closed");
            }
            CircuitState::Closed => {
                st.consecutive_failures = 0;
            }
            // A late success from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_failure = Some(Instant::now());
        st.last_failure_wall = Some(SystemTime::now());
        match st.state {
            CircuitState::Closed => {
                if st.consecutive_failures >= self.cfg.max_failures {
                    st.state = CircuitState::Open;
                    warn!(
                        breaker = self.name.as_str(),
                        failures = st.consecutive_failures,
                        reset_timeout_ms = self.cfg.reset_timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                warn!(
                    breaker = self.name.as_str(),
                    failures = st.consecutive_failures,
                    "circuit breaker probe failed, re-opened"
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let open_remaining_ms = match (st.state, st.last_failure) {
            (CircuitState::Open, Some(t)) => {
                let elapsed = t.elapsed();
                (elapsed < self.cfg.reset_timeout)
                    .then(|| (self.cfg.reset_timeout - elapsed).as_millis() as u64)
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            failure_count: st.consecutive_failures,
            last_failure_time: st.last_failure_wall,
            max_failures: self.cfg.max_failures,
            reset_timeout_ms: self.cfg.reset_timeout.as_millis() as u64,
            open_remaining_ms,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of consecutive failures that opens the circuit
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Set how long the circuit stays open after the last failure
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_max_failures(max_failures)
                .with_reset_timeout(reset_timeout),
        )
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.max_failures, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert!(cb.allow_request());
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.last_failure_time.is_none());
    }

    #[test]
    fn test_two_failures_open_the_circuit() {
        let cb = breaker(2, Duration::from_secs(30));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().failure_count, 2);

        // Third call is rejected without doing any work.
        assert!(!cb.allow_request());
        assert!(cb.snapshot().open_remaining_ms.is_some());
    }

    #[test]
    fn test_success_breaks_the_failure_streak() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 1);
    }

    #[test]
    fn test_half_open_after_reset_timeout_exactly_once() {
        let cb = breaker(1, Duration::from_millis(30));
        cb.record_failure();
        assert!(!cb.allow_request());

        thread::sleep(Duration::from_millis(45));

        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Failure count survives until the circuit closes.
        assert_eq!(cb.snapshot().failure_count, 1);
        // Further checks stay half-open, no second transition.
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        thread::sleep(Duration::from_millis(20));
        assert!(cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_timestamp() {
        let cb = breaker(1, Duration::from_millis(30));
        cb.record_failure();
        let first = cb.snapshot().last_failure_time.unwrap();
        thread::sleep(Duration::from_millis(45));
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        let second = cb.snapshot().last_failure_time.unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_late_success_does_not_close_open_circuit() {
        let cb = breaker(1, Duration::from_secs(30));
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let cb = breaker(0, Duration::from_secs(30));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        use std::sync::Arc;

        let cb = Arc::new(breaker(1000, Duration::from_secs(30)));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    cb_clone.record_failure();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.snapshot().failure_count, 500);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_racing_failures_cannot_miss_threshold() {
        use std::sync::Arc;

        let cb = Arc::new(breaker(8, Duration::from_secs(30)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || cb.record_failure())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
