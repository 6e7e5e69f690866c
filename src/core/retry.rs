use std::time::{Duration, Instant};

use crate::config::RetrySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_interval: settings.initial_interval,
            max_interval: settings.max_interval,
            max_elapsed: settings.max_elapsed,
            max_attempts: settings.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_interval,
            started: Instant::now(),
            attempts: 0,
        }
    }
}

/// Jitter-free doubling backoff bounded by attempts and total elapsed time.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    started: Instant,
    attempts: u32,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_attempt(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.policy.max_elapsed.saturating_sub(self.elapsed())
    }

    /// Next wait, or `None` once sleeping would exceed the elapsed budget.
    pub fn next_wait(&mut self) -> Option<Duration> {
        let elapsed = self.elapsed();
        self.next_wait_after(elapsed)
    }

    fn next_wait_after(&mut self, elapsed: Duration) -> Option<Duration> {
        let wait = self.current;
        if elapsed.saturating_add(wait) > self.policy.max_elapsed {
            return None;
        }
        self.current = self
            .current
            .saturating_mul(2)
            .min(self.policy.max_interval);
        Some(wait)
    }
}
