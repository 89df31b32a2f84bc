//! Reconnect Retry Policy
//!
//! Capped exponential backoff with multiplicative jitter.
//!
//! `delay(n) = min(max_delay, base_delay * 2^(n-1))`, then scaled by
//! `1 + U(-jitter, +jitter)` and clamped to `[0, max_delay]`. Attempt
//! numbering starts at 1.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Exponent cap; 2^62 ms is already far beyond any sane max delay
const MAX_EXPONENT: u32 = 62;

/// Retry configuration, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts allowed before the host is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first automatic retry (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any computed delay (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt connect timeout and default command timeout (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Fraction in [0, 1) applied multiplicatively to the computed delay
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_timeout_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Check the invariants the pool relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("maxAttempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "baseDelayMs ({}) must not exceed maxDelayMs ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        if self.timeout_ms == 0 {
            return Err("timeoutMs must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitterFactor must be in [0, 1), got {}",
                self.jitter_factor
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Calculate the backoff delay for `attempt`
///
/// `sample` is a uniform draw from [-1, 1] that selects where in the jitter
/// band the result lands; 0 yields the undisturbed exponential delay.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig, sample: f64) -> Duration {
    let exponent = attempt.max(1).saturating_sub(1).min(MAX_EXPONENT);
    let max_delay = config.max_delay_ms as f64;
    let delay = (config.base_delay_ms as f64 * 2f64.powi(exponent as i32)).min(max_delay);

    let sample = if sample.is_finite() {
        sample.clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let jittered = delay * (1.0 + config.jitter_factor * sample);

    Duration::from_millis(jittered.clamp(0.0, max_delay).round() as u64)
}

/// Backoff calculator with its own random source
///
/// Seeded construction makes the jitter sequence reproducible.
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before automatic attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let sample = if self.config.jitter_factor > 0.0 {
            self.rng.lock().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        calculate_backoff(attempt, &self.config, sample)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
