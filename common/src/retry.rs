// Retry policy with exponential backoff and jitter, shared by every network call site

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Default number of attempts per request (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry strategy trait for calculating retry delays
///
/// `attempt` is the zero-based index of the attempt that just failed.
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt, or None once attempts are exhausted
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Total attempts allowed, first try included
    fn max_attempts(&self) -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Check if another attempt is allowed after `attempt` failed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts()
    }
}

/// Exponential backoff retry strategy with jitter
/// Sequence with defaults: 500ms, 1s, 2s, ... capped at `max_delay_ms`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(
        max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(config: &RetryConfig) -> Self {
        Self::with_config(
            config.max_attempts,
            config.base_delay_ms,
            config.max_delay_ms,
            config.jitter_factor,
        )
    }

    /// base * 2^attempt, capped at max_delay
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }

        let base_delay_ms = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_ms)))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        Some(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
