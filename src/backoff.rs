//! Backoff strategies.
//!
//! A strategy maps a failure (or attempt) count to a delay. Two strategies
//! are provided:
//!
//! - [`ExponentialStrategy`]: `multiplier * 2^(n-1)`, capped at a maximum
//! - [`FullJitterStrategy`]: uniformly random in `[0, exponential(n)]`
//!
//! Strategies are stateless; the consumer keeps the failure counter.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

/// Maps a failure count to a delay.
pub trait BackoffStrategy: Debug + Send + Sync {
    /// Delay for the given count. A count of 0 always yields zero.
    fn calculate(&self, attempt: u32) -> Duration;

    /// Largest delay [`calculate`](Self::calculate) can return for `attempt`.
    /// Deterministic, unlike the delay itself for randomized strategies.
    fn ceiling(&self, attempt: u32) -> Duration;
}

/// Doubling delay, starting at `multiplier` for attempt 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialStrategy {
    multiplier: Duration,
    max: Duration,
}

impl ExponentialStrategy {
    /// Create a strategy that never returns more than `max`.
    pub fn new(multiplier: Duration, max: Duration) -> Self {
        Self { multiplier, max }
    }
}

impl BackoffStrategy for ExponentialStrategy {
    fn calculate(&self, attempt: u32) -> Duration {
        exponential(self.multiplier, self.max, attempt)
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        self.calculate(attempt)
    }
}

/// "Full jitter" backoff: a random delay between zero and the exponential
/// delay for the same attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullJitterStrategy {
    multiplier: Duration,
    max: Duration,
}

impl FullJitterStrategy {
    /// Create a strategy that never returns more than `max`.
    pub fn new(multiplier: Duration, max: Duration) -> Self {
        Self { multiplier, max }
    }
}

impl BackoffStrategy for FullJitterStrategy {
    fn calculate(&self, attempt: u32) -> Duration {
        let nanos = self.ceiling(attempt).as_nanos().min(u64::MAX as u128) as u64;
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..=nanos))
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        exponential(self.multiplier, self.max, attempt)
    }
}

fn exponential(multiplier: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    // 2^31 * any sane multiplier already saturates; clamp the shift
    let shift = (attempt - 1).min(31);
    multiplier
        .checked_mul(1u32 << shift)
        .unwrap_or(Duration::MAX)
        .min(max)
}
