//! Retry policy for transient Receive failures.
//!
//! A Receive that times out at the HTTP layer does not mean the command
//! failed; the executor re-issues it according to this policy, backing off
//! between attempts, until the bound is reached.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{TransportErrorKind, WinRmError, WinRmResult};

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Linear increase: delay * attempt.
    Linear,
    /// Exponential increase: delay * multiplier^attempt.
    Exponential,
    /// Exponential with random jitter.
    #[default]
    ExponentialWithJitter,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (caps exponential growth).
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy to use.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Multiplier for exponential/linear backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0), only used by `ExponentialWithJitter`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Whether to retry on per-request timeouts.
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,

    /// Whether to retry when the connection could not be established.
    #[serde(default)]
    pub retry_on_connect_failure: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            strategy: BackoffStrategy::default(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            retry_on_timeout: true,
            retry_on_connect_failure: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Reject multipliers and jitter factors the backoff cannot use.
    pub fn validate(&self) -> WinRmResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(WinRmError::Config(format!(
                "receive_retry.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(WinRmError::Config(format!(
                "receive_retry.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = match self.strategy {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Linear => 1.0 + (attempt as f64 * (self.multiplier - 1.0)),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                self.multiplier.powi(attempt.min(30) as i32)
            }
        };

        let capped_delay = self.scaled_initial_delay(factor).min(self.max_delay);

        if self.strategy == BackoffStrategy::ExponentialWithJitter && self.jitter > 0.0 {
            let jitter_range = capped_delay.as_secs_f64() * self.jitter.min(1.0);
            let jitter_value = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            let jittered_secs = (capped_delay.as_secs_f64() + jitter_value).max(0.0);
            Duration::try_from_secs_f64(jittered_secs)
                .unwrap_or(capped_delay)
                .min(self.max_delay)
        } else {
            capped_delay
        }
    }

    fn scaled_initial_delay(&self, factor: f64) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * factor;
        if secs.is_nan() || secs < 0.0 {
            return self.initial_delay;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &WinRmError) -> bool {
        match error {
            WinRmError::Transport { kind, .. } => match kind {
                TransportErrorKind::Timeout => self.retry_on_timeout,
                TransportErrorKind::Connect => self.retry_on_connect_failure,
                TransportErrorKind::Status(_) | TransportErrorKind::Other => false,
            },
            _ => false,
        }
    }
}
