use std::time;

/// The retry policy used to decide whether and when a failed message is
/// attempted again before it is dead-lettered.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Whether a message that has already been attempted `attempt` times
    /// still has budget for another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate the backoff before the next retry. `attempt` counts
    /// completed attempts, so the first retry passes 1.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(exponent);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}
