// resource-guard-rs/src/lib.rs
// Admission control in front of the generator: rate limit, then breaker.

pub mod circuit_breaker;
pub mod rate_limit;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use error_handling::{Error, ErrorKind, ServiceError};
use serde::Serialize;
use shared_types::config::ResourceGuardConfig;
use shared_types::{ExhaustedResource, Severity};
use thiserror::Error as ThisError;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitState};
pub use rate_limit::{RateDecision, RateLimitConfig, SlidingWindowLimiter};

/// Why the guard refused a generator call.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum GuardDenial {
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

impl GuardDenial {
    pub fn resource(&self) -> ExhaustedResource {
        match self {
            GuardDenial::RateLimited { .. } => ExhaustedResource::RateLimit,
            GuardDenial::CircuitOpen { .. } => ExhaustedResource::CircuitOpen,
        }
    }

    /// Retry hint in whole seconds, at least one.
    pub fn retry_after_seconds(&self) -> u64 {
        let retry_after = match self {
            GuardDenial::RateLimited { retry_after } | GuardDenial::CircuitOpen { retry_after } => {
                *retry_after
            }
        };
        RateDecision {
            allowed: false,
            retry_after,
        }
        .retry_after_seconds()
    }
}

impl ServiceError for GuardDenial {
    fn to_error(&self) -> Error {
        Error::new(ErrorKind::ResourceExhausted, self.to_string())
            .service("resource-guard")
            .severity(self.severity())
            .context("retry_after_seconds", self.retry_after_seconds())
            .transient()
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }
}

/// Point-in-time view of the guard for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStatus {
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub reopen_count: u32,
    pub cooldown_remaining_secs: Option<u64>,
    pub requests_in_window: u32,
    pub max_requests: u32,
    pub window_seconds: u64,
}

struct GuardState {
    limiter: SlidingWindowLimiter,
    breaker: CircuitBreaker,
}

/// Rate limiter and circuit breaker behind one lock, so a rate-limited call
/// never claims the half-open probe and a refused probe never consumes a slot.
pub struct ResourceGuard {
    state: Mutex<GuardState>,
}

impl ResourceGuard {
    pub fn new(rate_limit: RateLimitConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        Self {
            state: Mutex::new(GuardState {
                limiter: SlidingWindowLimiter::new(rate_limit),
                breaker: CircuitBreaker::new("generator", circuit_breaker),
            }),
        }
    }

    pub fn from_config(config: &ResourceGuardConfig) -> Self {
        Self::new(
            RateLimitConfig::from(&config.rate_limit),
            CircuitBreakerConfig::from(&config.circuit_breaker),
        )
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        // Critical sections hold no partial state across panics.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits one generator call or explains the refusal. The permit must
    /// be handed back with the call's outcome.
    pub fn admit(&self) -> Result<CallPermit, GuardDenial> {
        let now = Instant::now();
        let mut state = self.lock();

        let decision = state.limiter.check(now);
        if !decision.allowed {
            metrics::increment_counter!("constitution_guard_denials_total", "resource" => "rate_limit");
            debug!(retry_after_ms = decision.retry_after.as_millis() as u64, "rate limit denial");
            return Err(GuardDenial::RateLimited {
                retry_after: decision.retry_after,
            });
        }

        let permit = match state.breaker.try_acquire(now) {
            Ok(permit) => permit,
            Err(open) => {
                metrics::increment_counter!("constitution_guard_denials_total", "resource" => "circuit_open");
                debug!(retry_after_ms = open.retry_after.as_millis() as u64, "circuit open denial");
                return Err(GuardDenial::CircuitOpen {
                    retry_after: open.retry_after,
                });
            }
        };

        state.limiter.record(now);
        Ok(permit)
    }

    pub fn record_success(&self, permit: CallPermit) {
        self.lock().breaker.record_success(permit, Instant::now());
    }

    pub fn record_failure(&self, permit: CallPermit) {
        self.lock().breaker.record_failure(permit, Instant::now());
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().breaker.state()
    }

    pub fn status(&self) -> ResourceStatus {
        let now = Instant::now();
        let mut state = self.lock();
        let window = state.limiter.config().window;
        let max_requests = state.limiter.config().max_requests;
        ResourceStatus {
            circuit_state: state.breaker.state(),
            consecutive_failures: state.breaker.consecutive_failures(),
            reopen_count: state.breaker.reopen_count(),
            cooldown_remaining_secs: state
                .breaker
                .cooldown_remaining(now)
                .map(|remaining| remaining.as_secs_f64().ceil() as u64),
            requests_in_window: state.limiter.in_window(now),
            max_requests,
            window_seconds: window.as_secs(),
        }
    }

    /// Operator override: clears the window and closes the breaker.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.limiter.reset();
        state.breaker.reset();
        warn!("resource guard reset by administrator");
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests;
