//! Retry backoff policy.
//!
//! The delay before attempt `n + 1` after `n` finished attempts is
//!
//! ```text
//! min(max_delay, base_delay * multiplier^(n - 1)) * jitter_factor
//! ```
//!
//! where `jitter_factor` lies in `[1 - jitter, 1 + jitter]` and is derived
//! from an FNV-1a hash of the task id and attempt number. The same task and
//! attempt always get the same delay, which keeps retries reproducible in
//! tests while still spreading a burst of failures apart.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(task_id: &str, attempt: u32) -> u64 {
    task_id
        .as_bytes()
        .iter()
        .chain(attempt.to_le_bytes().iter())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        })
}

/// Exponential backoff with deterministic jitter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brain::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0);
/// assert_eq!(policy.delay_for("t-1", 1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for("t-1", 3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for("t-1", 30), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    /// Creates a policy. `multiplier` below 1 is raised to 1 and `jitter`
    /// is clamped to `[0, 1]`.
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            jitter: if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    /// Retries become eligible immediately.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0, 0.0)
    }

    /// Delay after `attempt` finished attempts (one-based).
    pub fn delay_for(&self, task_id: &str, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_delay.as_secs_f64();
        let raw = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);

        let factor = if self.jitter > 0.0 {
            let unit = fnv1a(task_id, attempt) as f64 / u64::MAX as f64;
            1.0 - self.jitter + 2.0 * self.jitter * unit
        } else {
            1.0
        };

        Duration::try_from_secs_f64(raw * factor).unwrap_or(self.max_delay)
    }

    /// Earliest time the next attempt may be claimed.
    pub fn next_eligible(&self, task_id: &str, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(task_id, attempt);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.jitter,
        )
    }
}
