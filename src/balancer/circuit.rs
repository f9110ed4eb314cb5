//! Circuit breaker
//!
//! Per-instance breaker isolating upstreams that fail repeatedly. Closed
//! circuits count consecutive failures; open circuits refuse selection until
//! a cooldown elapses; half-open circuits admit a bounded number of trial
//! requests. A failed trial re-opens the circuit with a doubled cooldown,
//! capped, and a successful trial closes it and resets the escalation.
//!
//! The breaker is a plain struct. Selection and outcome reporting already
//! serialize on the per-service lock, so no internal locking is needed.

use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Cooldown after the first trip
    pub cooldown: Duration,
    /// Ceiling for escalated cooldowns
    pub max_cooldown: Duration,
    /// Concurrent trial requests allowed while half-open
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
            half_open_max: 1,
        }
    }
}

/// Per-instance circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    current_cooldown: Duration,
    half_open_inflight: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            current_cooldown,
            half_open_inflight: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Non-mutating eligibility check used while filtering candidates.
    pub fn is_selectable(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.open_until.map(|at| now >= at).unwrap_or(false),
            CircuitState::HalfOpen => self.half_open_inflight < self.config.half_open_max,
        }
    }

    /// Take a selection slot. Performs the open to half-open transition when
    /// the cooldown has elapsed. Each acquired slot must be paired with a
    /// later `record_success` or `record_failure`.
    pub fn acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_until.map(|at| now >= at).unwrap_or(false) {
                    log::info!("circuit half-open, allowing trial request");
                    self.state = CircuitState::HalfOpen;
                    self.half_open_inflight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_inflight < self.config.half_open_max {
                    self.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                log::info!("circuit closed after successful trial");
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.half_open_inflight = 0;
                self.open_until = None;
                self.current_cooldown = self.config.cooldown;
            }
            CircuitState::Open => {
                // Late result from a request that started before the trip.
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    let cooldown = self.current_cooldown;
                    self.trip(now, cooldown);
                }
            }
            CircuitState::HalfOpen => {
                let next = (self.current_cooldown * 2).min(self.config.max_cooldown);
                self.trip(now, next);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self, now: Instant, cooldown: Duration) {
        log::warn!("circuit open for {:?}", cooldown);
        self.state = CircuitState::Open;
        self.open_until = Some(now + cooldown);
        self.current_cooldown = cooldown;
        self.half_open_inflight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
            max_cooldown: Duration::from_secs(600),
            half_open_max: 1,
        })
    }

    #[test]
    fn test_closed_to_open_at_threshold() {
        let mut cb = breaker(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(cb.acquire(now));
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.acquire(now));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker(3, Duration::from_secs(60));
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_single_trial() {
        let mut cb = breaker(1, Duration::from_millis(10));
        let now = Instant::now();
        cb.record_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.acquire(now));

        let later = now + Duration::from_millis(20);
        assert!(cb.is_selectable(later));
        assert!(cb.acquire(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one concurrent trial.
        assert!(!cb.acquire(later));
    }

    #[test]
    fn test_half_open_success_closes() {
        let mut cb = breaker(1, Duration::from_millis(10));
        let now = Instant::now();
        cb.record_failure(now);
        let later = now + Duration::from_millis(20);
        assert!(cb.acquire(later));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire(later));
    }

    #[test]
    fn test_half_open_failure_escalates_cooldown() {
        let mut cb = breaker(1, Duration::from_millis(100));
        let now = Instant::now();
        cb.record_failure(now);

        let t1 = now + Duration::from_millis(150);
        assert!(cb.acquire(t1));
        cb.record_failure(t1);
        assert_eq!(cb.state(), CircuitState::Open);

        // The base cooldown has doubled, so the old interval is not enough.
        assert!(!cb.acquire(t1 + Duration::from_millis(150)));
        assert!(cb.acquire(t1 + Duration::from_millis(250)));
    }

    #[test]
    fn test_cooldown_escalation_is_capped() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(90),
            half_open_max: 1,
        });
        let mut now = Instant::now();
        cb.record_failure(now);
        for _ in 0..4 {
            now += Duration::from_secs(120);
            assert!(cb.acquire(now));
            cb.record_failure(now);
        }
        assert!(cb.current_cooldown <= Duration::from_secs(90));
    }
}
