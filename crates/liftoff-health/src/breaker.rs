//! Per-probe circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures;
//! Open → HalfOpen once the cooldown elapses; HalfOpen → Closed after
//! `half_open_retries` consecutive successes; HalfOpen → Open on any
//! failure. While open, the guarded probe must not be invoked.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing again.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close.
    pub half_open_retries: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            half_open_retries: 3,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A three-state guard preventing repeated invocation of a failing probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    /// Consecutive failure count.
    failures: u32,
    /// Consecutive successes while half-open.
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    /// Total state transitions since creation.
    transitions: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: 0,
            half_open_successes: 0,
            last_failure_at: None,
            transitions: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Whether an invocation is allowed right now. Moves Open → HalfOpen
    /// when the cooldown has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    self.set_state(BreakerState::HalfOpen);
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Cooldown left before the breaker will probe again, if open.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        if self.state != BreakerState::Open {
            return None;
        }
        let elapsed = self.last_failure_at?.elapsed();
        Some(self.config.cooldown.saturating_sub(elapsed))
    }

    /// Record a successful invocation.
    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failures = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_retries {
                    self.set_state(BreakerState::Closed);
                    self.failures = 0;
                    self.half_open_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed invocation.
    pub fn on_failure(&mut self) {
        self.last_failure_at = Some(Instant::now());
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    warn!(
                        failures = self.failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                    self.set_state(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                self.failures += 1;
                self.set_state(BreakerState::Open);
            }
            BreakerState::Open => {
                self.failures += 1;
            }
        }
    }

    fn set_state(&mut self, next: BreakerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "circuit breaker transition");
            self.state = next;
            self.transitions += 1;
        }
    }
}
