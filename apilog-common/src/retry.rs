use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy used while acquiring the database connection at startup.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            backoff_coefficient: 2,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time to wait after the given (0-based) failed attempt before trying again.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Sum of all delays taken before the given number of failed attempts succeed on the next one.
    pub fn total_delay(&self, failed_attempts: u32) -> time::Duration {
        (0..failed_attempts)
            .map(|attempt| self.time_until_next_retry(attempt))
            .fold(time::Duration::ZERO, |total, delay| {
                total.saturating_add(delay)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, time::Duration::from_secs(1))
    }
}
