//! Backoff policies mapping an attempt count to a wait duration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A function from attempt count to the delay before the next attempt.
///
/// Attempt `0` is the first call, so `delay(0)` is the wait after the
/// first failure.
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Capped exponential backoff: `min(cap, base * multiplier^attempt)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(100),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
            jitter: false,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for `attempt` before jitter.
    #[must_use]
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let cap_secs = self.cap.as_secs_f64();
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= cap_secs {
            return self.cap;
        }
        Duration::try_from_secs_f64(raw).unwrap_or(self.cap)
    }
}

impl Backoff for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter {
            // A factor <= 1.0 keeps the jittered delay under the cap.
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }
}

/// Per-run retry bookkeeping. Reset by creating a new value for each run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl RetryState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempt: 0,
            next_delay: Duration::ZERO,
        }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn advance(&mut self, backoff: &dyn Backoff) -> Duration {
        self.next_delay = backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay
    }
}
