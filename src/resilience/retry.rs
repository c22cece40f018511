// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Used in two shapes:
//! - [`retry()`] wraps an async operation and retries it in place (backend
//!   connects, push reconnects).
//! - [`RetryConfig::delay_for_attempt()`] computes the delay for a retry that
//!   is *scheduled* rather than awaited (queued mutations record a
//!   `next_attempt_at` and are picked up by a later drain).
//!
//! # Example
//!
//! ```
//! use task_sync_engine::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Push reconnect: never give up
//! let reconnect = RetryConfig::reconnect();
//! assert_eq!(reconnect.max_retries, None);
//!
//! let policy = RetryConfig::mutation();
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff policy. `max_retries: None` never gives up.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl RetryConfig {
    /// Opening a backend at startup: five attempts, about three seconds in
    /// total, so a bad URL surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// The push channel: retried forever, at most 30s apart.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Single store round-trips (SQLite busy, Redis hiccup).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Queued mutations: 5 attempts, then the mutation is marked failed.
    #[must_use]
    pub fn mutation() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
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
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether `attempts` failures have used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts as usize >= max)
    }
}

/// Run `operation` until it succeeds or `config` runs out of attempts.
///
/// The last error is returned once the budget is spent. With
/// `max_retries: None` this only returns on success.
pub async fn retry<F, Fut, T, E>(name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    info!(operation = name, failures, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        if config.is_exhausted(failures) {
            warn!(operation = name, failures, error = %err, "Giving up");
            return Err(err);
        }

        let delay = config.delay_for_attempt(failures);
        warn!(
            operation = name,
            attempt = failures,
            max = ?config.max_retries,
            error = %err,
            retry_in = ?delay,
            "Operation failed, retrying"
        );
        sleep(delay).await;
    }
}
