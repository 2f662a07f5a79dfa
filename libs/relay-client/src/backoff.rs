use std::time::Duration;

use crate::config::BackoffConfig;

impl BackoffConfig {
    /// Delay before retry number `retry` (0-based): `base * multiplier^retry`, capped at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let raw = self.base_ms as f64 * self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Attempt counter over a [`BackoffConfig`].
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a BackoffConfig,
    failures: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(config: &'a BackoffConfig) -> Self {
        Self { config, failures: 0 }
    }

    /// Record a failed attempt. Returns the delay before the next attempt,
    /// or `None` once `max_attempts` attempts have failed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }
        Some(self.config.delay(self.failures - 1))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
