//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff parameters, shared by reconnection and publish retry.
///
/// Delays grow as `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
/// The actual wait is drawn uniformly from `[0, ceiling]` (full jitter), so
/// a fleet of gateways recovering from the same broker outage does not
/// reconnect in lockstep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Upper bound of the delay for the given attempt (1-indexed).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(63);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Full-jitter delay: uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.ceiling(attempt).as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}
