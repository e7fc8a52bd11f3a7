//! Retry delays after failed sync cycles

use std::time::Duration;

use crate::config::EngineConfig;

/// Capped exponential backoff that never undercuts a provider `Retry-After`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exponential = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        retry_after.map_or(exponential, |after| after.max(exponential))
    }
}

impl From<&EngineConfig> for BackoffPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_ceiling())
    }
}
