//! Exponential backoff used by reconnecting dialers and the receive loop.

use std::time::Duration;

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl Backoff {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            min_delay_ms,
            max_delay_ms: max_delay_ms.max(min_delay_ms),
        }
    }

    /// Delay before retry `attempt` (0-indexed): `min * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .min_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}
