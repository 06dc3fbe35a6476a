//! Retry policy for execution attempts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay shape between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    /// `initial + step * (n - 1)` before retry `n`, capped at `max`.
    Linear {
        #[serde(default = "default_delay_ms")]
        initial_ms: u64,
        #[serde(default = "default_step_ms")]
        step_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_delay_ms() -> u64 {
    500
}

fn default_step_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    5_000
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear {
            initial_ms: default_delay_ms(),
            step_ms: default_step_ms(),
            max_ms: default_max_ms(),
        }
    }
}

/// How long to wait between failed attempts.
///
/// The attempt budget itself comes from each task's `max_retries`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    pub fn linear(initial: Duration, step: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Linear {
                initial_ms: initial.as_millis() as u64,
                step_ms: step.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            },
        }
    }

    /// No delay at all.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay to wait after `failed_attempt` (1-based) before the next one.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let n = u64::from(failed_attempt.max(1));
        let ms = match &self.backoff {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear {
                initial_ms,
                step_ms,
                max_ms,
            } => initial_ms
                .saturating_add(step_ms.saturating_mul(n - 1))
                .min(*max_ms),
        };
        Duration::from_millis(ms)
    }
}

/// Source of retry delays, swappable in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
