use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `base * factor^n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        Self { base, factor: 2 }
    }

    /// Delay for exponent `n`, saturating instead of overflowing
    pub fn delay_for(&self, n: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(n);
        self.base.saturating_mul(multiplier)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(2000))
    }
}
