//! Reconnection backoff for failing peers
//!
//! Delays grow exponentially from `initial_delay` by `factor` per failed
//! attempt, capped at `max_delay`, with up to `jitter * delay` of random
//! extra spread so that reconnect storms do not synchronise.

use crate::config::{ConfigError, ConfigResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential delay schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffStrategy {
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub factor: f64,
    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffStrategy {
    /// Delay for the given number of failed attempts, without jitter
    ///
    /// Non-decreasing in `failed_attempts` and never above `max_delay`.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempts - 1).min(64) as i32;
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Delay before the next reconnection attempt, including jitter
    pub fn next_timeout(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        (base + self.calculate_jitter(base)).min(self.max_delay)
    }

    fn calculate_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 || base.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        base.mul_f64(self.jitter * rng.gen::<f64>())
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::Invalid {
                field: "backoff.initial_delay".to_string(),
                message: "Initial delay must be positive".to_string(),
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::Invalid {
                field: "backoff.max_delay".to_string(),
                message: "Max delay must not be below the initial delay".to_string(),
            });
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoff.factor".to_string(),
                message: "Factor must be at least 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid {
                field: "backoff.jitter".to_string(),
                message: "Jitter must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// When to give up on a peer, and how long to wait between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Failed attempts after which a peer is disabled
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub strategy: BackoffStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            strategy: BackoffStrategy::default(),
        }
    }
}

impl BackoffConfig {
    /// Build a validated backoff configuration
    pub fn new(max_attempts: u32, strategy: BackoffStrategy) -> ConfigResult<Self> {
        let config = Self {
            max_attempts,
            strategy,
        };
        config.validate()?;
        Ok(config)
    }

    /// Whether a peer with this many failures should be disabled
    pub fn should_disable(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }

    /// Validate all values
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "backoff.max_attempts".to_string(),
                message: "Max attempts must be at least 1".to_string(),
            });
        }
        self.strategy.validate()
    }
}
