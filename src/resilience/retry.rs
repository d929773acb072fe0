// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff with jitter.
//!
//! Three places in the engine back off: the initial cluster connection,
//! singleflight losers polling for the winner's value, and write-behind
//! jobs waiting for their next attempt. Each has a preset.
//!
//! # Example
//!
//! ```
//! use cache_engine::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Write-behind: delay grows with attempt count, capped
//! let wb = RetryConfig::write_behind();
//! assert!(wb.delay_for_attempt(10) <= wb.max_delay.mul_f64(1.0 + wb.jitter));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for backoff behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::poll()`] - Short polls while another task rebuilds a key
/// - [`RetryConfig::write_behind()`] - Requeue delays for failed origin writes
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    /// Fraction of each delay randomized in both directions (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Polling schedule for singleflight losers.
    ///
    /// Budget is roughly `base * (1 + 2 + 4 + 4 ...)`, bounded by `max_polls`.
    #[must_use]
    pub fn poll(base: Duration, max_polls: usize) -> Self {
        Self {
            max_retries: Some(max_polls),
            initial_delay: base,
            max_delay: base.saturating_mul(4),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Requeue delays for failed write-behind jobs.
    #[must_use]
    pub fn write_behind() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let base = self
            .initial_delay
            .mul_f64(self.factor.powi(exp))
            .min(self.max_delay);
        apply_jitter(base, self.jitter)
    }
}

/// Spread `base` uniformly over `base * (1 ± fraction)`.
#[must_use]
pub fn apply_jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || base.is_zero() {
        return base;
    }
    let fraction = fraction.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    base.mul_f64(factor)
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts as usize >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    next_retry = ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
            }
        }
    }
}
