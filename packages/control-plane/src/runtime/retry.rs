// packages/control-plane/src/runtime/retry.rs
//! Exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule shared by task retries and dependency reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First retry delay in milliseconds (default: 1000)
    pub base_delay_ms: u64,

    /// Ceiling for any single delay in milliseconds (default: 60000)
    pub max_delay_ms: u64,

    /// Attempts before giving up (default: 3)
    pub max_attempts: u32,

    /// Randomise each delay within [50%, 100%] of its nominal value (default: true)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry_count, max)`
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Backoff delay with jitter applied when enabled
    pub fn jittered_delay(&self, retry_count: u32) -> Duration {
        let nominal = self.backoff_delay(retry_count);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let millis = nominal.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    /// True while another attempt is allowed after `attempts` have been made
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
