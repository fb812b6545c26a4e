//! Reconnection delay policy for the client agent

use portico_common::ResilienceConfig;
use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay
    pub base: Duration,
    /// Maximum delay
    pub max: Duration,
    /// Multiplier for each attempt; 1.0 gives a fixed delay
    pub factor: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        ResilienceConfig::default().into()
    }
}

impl From<ResilienceConfig> for BackoffConfig {
    fn from(config: ResilienceConfig) -> Self {
        Self {
            base: config.reconnect_base,
            max: config.reconnect_max,
            factor: config.factor,
            jitter: config.jitter_factor,
        }
    }
}

/// Delay calculator for successive reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the next delay and increment attempt counter
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.calculate_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a session registered successfully
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn calculate_delay(&self) -> Duration {
        let base_secs = self.config.base.as_secs_f64();
        let max_secs = self.config.max.as_secs_f64();
        let attempt: i32 = self.attempt.try_into().unwrap_or(i32::MAX);
        // Cap before jittering; the raw product overflows to inf after ~1000 attempts
        let exp_delay = (base_secs * self.config.factor.max(1.0).powi(attempt)).min(max_secs);

        let jitter_range = exp_delay * self.config.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let delay_with_jitter = (exp_delay + jitter).max(0.0);

        let final_secs = delay_with_jitter.min(max_secs);

        Duration::from_secs_f64(final_secs)
    }
}
