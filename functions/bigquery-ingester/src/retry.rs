use bon::Builder;
use std::time::Duration;

/// Backoff applied when a trigger finds its backup still running.
///
/// Attempts are numbered from 0. The delay before re-checking after attempt
/// `n` is `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Builder, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    #[builder(default = Duration::from_secs(60))]
    pub initial_delay: Duration,

    #[builder(default = 2)]
    pub multiplier: u32,

    #[builder(default = Duration::from_secs(900))]
    pub max_delay: Duration,

    /// Total number of completion checks before giving up. `None` polls forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().max_attempts(48).build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt);
        let initial_millis = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial_millis.saturating_mul(factor)).min(self.max_delay)
    }

    /// Decide what to do after `attempt` found the backup incomplete.
    pub fn next(&self, attempt: u32) -> RetryDecision {
        match self.max_attempts {
            Some(max) if attempt.saturating_add(1) >= max => RetryDecision::GiveUp,
            _ => RetryDecision::RetryAfter(self.delay_for(attempt)),
        }
    }
}
