// resource-guard-rs/src/rate_limit.rs
// Sliding window request limiter.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use shared_types::config::RateLimitSettings;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests.max(1),
            window: Duration::from_secs(settings.window_seconds.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until the oldest admitted request leaves the window; zero when allowed.
    pub retry_after: Duration,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    /// Whole seconds to wait, rounded up and never below one for a denial.
    pub fn retry_after_seconds(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

/// Admits at most `max_requests` calls in any trailing `window`.
///
/// Not synchronised on its own; `ResourceGuard` serialises access.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    admitted: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            admitted: VecDeque::with_capacity(config.max_requests as usize),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Decides without recording an admission.
    pub fn check(&mut self, now: Instant) -> RateDecision {
        self.evict(now);
        if (self.admitted.len() as u32) < self.config.max_requests {
            return RateDecision::allow();
        }
        let retry_after = self
            .admitted
            .front()
            .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
            .unwrap_or(self.config.window);
        RateDecision {
            allowed: false,
            retry_after,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
    }

    pub fn try_acquire(&mut self, now: Instant) -> RateDecision {
        let decision = self.check(now);
        if decision.allowed {
            self.record(now);
        }
        decision
    }

    /// Admissions still inside the window.
    pub fn in_window(&mut self, now: Instant) -> u32 {
        self.evict(now);
        self.admitted.len() as u32
    }

    pub fn reset(&mut self) {
        self.admitted.clear();
    }
}
