//! # Circuit Breaker
//!
//! Stops calls to a failing generator and probes for recovery.
//!
//! - `Closed`: calls flow; consecutive failures inside `failure_window` are counted
//! - `Open`: calls are refused until the cool-down elapses
//! - `HalfOpen`: exactly one probe is in flight at a time
//!
//! A failed probe reopens the circuit with the cool-down doubled, capped at
//! `max_cooldown`. `success_threshold` consecutive probe successes close it.
//!
//! Every admission returns a [`CallPermit`] stamped with the circuit epoch,
//! which advances on each state change. An outcome reported with a permit
//! from an earlier epoch is ignored, so a slow call admitted while `Closed`
//! can never settle the `HalfOpen` probe.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared_types::config::CircuitBreakerSettings;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, one probe allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub success_threshold: u32,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        let cooldown = Duration::from_secs(settings.cooldown_secs);
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            failure_window: Duration::from_secs(settings.failure_window_secs),
            cooldown,
            success_threshold: settings.success_threshold.max(1),
            max_cooldown: Duration::from_secs(settings.max_cooldown_secs).max(cooldown),
        }
    }
}

/// Admission issued by [`CircuitBreaker::try_acquire`]; hand it back with
/// the call's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    epoch: u64,
    probe: bool,
}

impl CallPermit {
    /// True for the single call admitted while half-open.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Refusal from the breaker with the time until the next probe may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    /// First failure of the current streak.
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    /// Consecutive failed probes since the circuit last closed.
    reopen_count: u32,
    probe_in_flight: bool,
    probe_successes: u32,
    /// Advances on every state change and on reset.
    epoch: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_started: None,
            opened_at: None,
            current_cooldown,
            reopen_count: 0,
            probe_in_flight: false,
            probe_successes: 0,
            epoch: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reopen_count(&self) -> u32 {
        self.reopen_count
    }

    pub fn current_cooldown(&self) -> Duration {
        self.current_cooldown
    }

    /// Time left before a probe is allowed; `None` unless open.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some((opened_at + self.current_cooldown).saturating_duration_since(now))
            }
            _ => None,
        }
    }

    /// Decides without side effects.
    pub fn check(&self, now: Instant) -> Result<(), CircuitOpen> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => match self.cooldown_remaining(now) {
                Some(remaining) if remaining > Duration::ZERO => Err(CircuitOpen {
                    retry_after: remaining,
                }),
                _ => Ok(()),
            },
            CircuitState::HalfOpen if self.probe_in_flight => Err(CircuitOpen {
                retry_after: Duration::from_secs(1),
            }),
            CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Admits a call, moving an expired `Open` circuit to `HalfOpen` and
    /// claiming the single probe slot.
    pub fn try_acquire(&mut self, now: Instant) -> Result<CallPermit, CircuitOpen> {
        self.check(now)?;
        let probe = match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                self.transition(CircuitState::HalfOpen);
                self.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            epoch: self.epoch,
            probe,
        })
    }

    /// Outcomes from an earlier epoch describe a circuit that no longer
    /// exists and are dropped.
    fn is_stale(&self, permit: CallPermit, outcome: &'static str) -> bool {
        if permit.epoch == self.epoch {
            return false;
        }
        debug!(
            circuit = %self.name,
            outcome,
            permit_epoch = permit.epoch,
            epoch = self.epoch,
            "outcome from an earlier circuit epoch, ignoring"
        );
        metrics::increment_counter!(
            "constitution_circuit_stale_outcomes_total",
            "circuit" => self.name.clone()
        );
        true
    }

    pub fn record_success(&mut self, permit: CallPermit, _now: Instant) {
        if self.is_stale(permit, "success") {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.streak_started = None;
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.probe_successes += 1;
                if self.probe_successes >= self.config.success_threshold {
                    info!(
                        circuit = %self.name,
                        successes = self.probe_successes,
                        "Circuit CLOSED: generator recovered"
                    );
                    self.close();
                }
            }
            CircuitState::Open => {
                debug!(circuit = %self.name, "success recorded while open, ignoring");
            }
        }
    }

    pub fn record_failure(&mut self, permit: CallPermit, now: Instant) {
        if self.is_stale(permit, "failure") {
            return;
        }
        match self.state {
            CircuitState::Closed => {
                let streak_expired = self
                    .streak_started
                    .map(|started| now.saturating_duration_since(started) > self.config.failure_window)
                    .unwrap_or(true);
                if streak_expired {
                    self.consecutive_failures = 0;
                    self.streak_started = Some(now);
                }
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit OPEN: failure threshold reached"
                    );
                    self.current_cooldown = self.config.cooldown;
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                self.reopen_count = self.reopen_count.saturating_add(1);
                let factor = 2u32.saturating_pow(self.reopen_count);
                self.current_cooldown = self
                    .config
                    .cooldown
                    .saturating_mul(factor)
                    .min(self.config.max_cooldown);
                warn!(
                    circuit = %self.name,
                    reopen_count = self.reopen_count,
                    cooldown_secs = self.current_cooldown.as_secs(),
                    "Circuit re-OPENED: probe failed"
                );
                self.open(now);
            }
            CircuitState::Open => {
                debug!(circuit = %self.name, "failure recorded while open, ignoring");
            }
        }
    }

    /// Administrative reset to `Closed` with all counters cleared. Calls
    /// admitted before the reset no longer count.
    pub fn reset(&mut self) {
        self.close();
        self.epoch += 1;
    }

    fn open(&mut self, now: Instant) {
        self.transition(CircuitState::Open);
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.probe_successes = 0;
        metrics::increment_counter!("constitution_circuit_opened_total", "circuit" => self.name.clone());
    }

    fn close(&mut self) {
        self.transition(CircuitState::Closed);
        self.consecutive_failures = 0;
        self.streak_started = None;
        self.opened_at = None;
        self.current_cooldown = self.config.cooldown;
        self.reopen_count = 0;
        self.probe_in_flight = false;
        self.probe_successes = 0;
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state != next {
            debug!(circuit = %self.name, from = %self.state, to = %next, "circuit transition");
            self.state = next;
            self.epoch += 1;
            metrics::gauge!(
                "constitution_circuit_state",
                next.gauge_value(),
                "circuit" => self.name.clone()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(10),
                success_threshold: 1,
                max_cooldown: Duration::from_secs(35),
            },
        )
    }

    fn trip(breaker: &mut CircuitBreaker, now: Instant) {
        for _ in 0..3 {
            let permit = breaker.try_acquire(now).expect("closed breaker admits");
            breaker.record_failure(permit, now);
        }
    }

    fn fail_once(breaker: &mut CircuitBreaker, now: Instant) {
        let permit = breaker.try_acquire(now).expect("closed breaker admits");
        breaker.record_failure(permit, now);
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);
        assert_eq!(breaker.state(), CircuitState::Open);

        let refused = breaker.try_acquire(now + Duration::from_secs(4)).unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(6));
    }

    #[test]
    fn success_resets_the_streak() {
        let mut breaker = breaker();
        let now = Instant::now();
        fail_once(&mut breaker, now);
        fail_once(&mut breaker, now);
        let permit = breaker.try_acquire(now).unwrap();
        breaker.record_success(permit, now);
        fail_once(&mut breaker, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn failures_outside_window_start_a_new_streak() {
        let mut breaker = breaker();
        let start = Instant::now();
        fail_once(&mut breaker, start);
        fail_once(&mut breaker, start + Duration::from_secs(30));
        fail_once(&mut breaker, start + Duration::from_secs(61));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);

        let later = now + Duration::from_secs(10);
        let probe = breaker.try_acquire(later).unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(later).is_err());

        breaker.record_success(probe, later);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire(later).is_ok());
    }

    #[test]
    fn failed_probes_back_off_exponentially_up_to_cap() {
        let mut breaker = breaker();
        let mut now = Instant::now();
        trip(&mut breaker, now);

        let mut observed = Vec::new();
        for _ in 0..3 {
            now += breaker.current_cooldown();
            let probe = breaker.try_acquire(now).expect("probe admitted after cool-down");
            breaker.record_failure(probe, now);
            observed.push(breaker.current_cooldown().as_secs());
        }
        assert_eq!(observed, vec![20, 35, 35]);
        assert_eq!(breaker.reopen_count(), 3);
    }

    #[test]
    fn late_success_from_closed_epoch_does_not_settle_probe() {
        let mut breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..breaker().config
            },
        );
        let now = Instant::now();
        let first = breaker.try_acquire(now).unwrap();
        let slow = breaker.try_acquire(now).unwrap();
        breaker.record_failure(first, now);
        assert_eq!(breaker.state(), CircuitState::Open);

        let later = now + Duration::from_secs(10);
        let probe = breaker.try_acquire(later).unwrap();
        breaker.record_success(slow, later);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(later).is_err());

        // A late failure does not reopen or back off either.
        breaker.record_failure(slow, later);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.reopen_count(), 0);

        breaker.record_success(probe, later);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn outcome_admitted_before_reset_is_ignored() {
        let mut breaker = breaker();
        let now = Instant::now();
        let before = breaker.try_acquire(now).unwrap();
        breaker.reset();
        breaker.record_failure(before, now);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn reset_closes_and_clears() {
        let mut breaker = breaker();
        let now = Instant::now();
        trip(&mut breaker, now);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.try_acquire(now).is_ok());
    }
}
