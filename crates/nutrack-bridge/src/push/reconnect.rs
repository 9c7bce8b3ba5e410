//! Reconnect schedule for the push stream.
//!
//! Linear backoff: retry N waits N × base delay. After `max_attempts`
//! retries have failed the channel gives up.

use crate::config::PushConfig;
use std::time::Duration;

/// Configuration for reconnect behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries allowed after the first failure.
    pub max_attempts: u32,
    /// Delay unit; retry N waits `N * base_delay`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: PushConfig::MAX_RECONNECT_ATTEMPTS,
            base_delay: PushConfig::RECONNECT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry `attempt` (1-indexed), or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay * attempt)
    }
}
